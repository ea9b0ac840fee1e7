use super::error::err;
use super::types::Request;

/// Required trimmed non-empty string param; `Err` carries the ready-made
/// `bad_params` response.
pub fn require_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("missing {}", key),
            None,
        )),
    }
}

pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn opt_bool(req: &Request, key: &str) -> Option<bool> {
    req.params.get(key).and_then(|v| v.as_bool())
}

pub fn opt_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}
