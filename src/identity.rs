//! Participant identity resolution.
//!
//! Joining from two tabs, or a flaky network retrying a join, can leave
//! several participant rows sharing one session id. Submissions still have
//! to land on exactly one row, so resolution is deterministic: prefer the
//! candidate whose network identity matches the submitter, and fall back to
//! the most recently created row. A candidate that already holds answers is
//! never displaced by an empty duplicate from the same address.

use crate::scoring::ScoringError;

/// One participant row competing for a session id. `created_seq` is the
/// SQLite rowid, a monotonic creation sequence.
#[derive(Debug, Clone)]
pub struct ParticipantCandidate {
    pub id: String,
    pub ip_address: Option<String>,
    pub device_fingerprint: Option<String>,
    pub answer_count: i64,
    pub created_seq: i64,
}

/// Network identity of the request doing the resolving.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub ip_address: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Canonical form of a participant name for identity grouping: trimmed,
/// case-folded, inner whitespace collapsed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Pick the participant a submission belongs to when `session_id` matches
/// more than one row.
///
/// Priority: exact ip + device fingerprint match, then ip match, then the
/// most recently created candidate. After the pick, if the chosen row
/// already has answers while another row from the same address has none,
/// the empty row wins; a duplicate join must not overwrite work in
/// progress.
pub fn resolve_participant(
    candidates: &[ParticipantCandidate],
    ctx: &RequestIdentity,
) -> Result<String, ScoringError> {
    match candidates {
        [] => Err(ScoringError::new(
            "participant_not_found",
            "no participant for session",
        )),
        [only] => Ok(only.id.clone()),
        _ => Ok(resolve_among(candidates, ctx)),
    }
}

fn resolve_among(candidates: &[ParticipantCandidate], ctx: &RequestIdentity) -> String {
    let chosen = pick(candidates, ctx);

    // A second tab joining from the same address creates an empty row; the
    // submission belongs to whichever row is not holding answers yet.
    let final_pick = if chosen.answer_count > 0 {
        candidates
            .iter()
            .filter(|c| c.id != chosen.id && c.answer_count == 0)
            .filter(|c| same_ip(c, chosen))
            .max_by_key(|c| c.created_seq)
            .unwrap_or(chosen)
    } else {
        chosen
    };

    tracing::warn!(
        candidates = candidates.len(),
        picked = %final_pick.id,
        "duplicate session id resolved heuristically"
    );
    final_pick.id.clone()
}

fn pick<'a>(
    candidates: &'a [ParticipantCandidate],
    ctx: &RequestIdentity,
) -> &'a ParticipantCandidate {
    if ctx.ip_address.is_some() && ctx.device_fingerprint.is_some() {
        if let Some(c) = candidates
            .iter()
            .filter(|c| {
                c.ip_address == ctx.ip_address && c.device_fingerprint == ctx.device_fingerprint
            })
            .max_by_key(|c| c.created_seq)
        {
            return c;
        }
    }
    if ctx.ip_address.is_some() {
        if let Some(c) = candidates
            .iter()
            .filter(|c| c.ip_address == ctx.ip_address)
            .max_by_key(|c| c.created_seq)
        {
            return c;
        }
    }
    candidates
        .iter()
        .max_by_key(|c| c.created_seq)
        .expect("resolve_among called with at least two candidates")
}

fn same_ip(a: &ParticipantCandidate, b: &ParticipantCandidate) -> bool {
    match (&a.ip_address, &b.ip_address) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
