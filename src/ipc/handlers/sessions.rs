use crate::identity::normalize_name;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, require_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(super) struct QuizGate {
    pub id: String,
    pub max_attempts: i64,
    pub allow_retries: bool,
    pub is_active: bool,
    pub expires_at: Option<String>,
}

pub(super) fn load_quiz_gate(
    conn: &Connection,
    where_sql: &str,
    key: &str,
) -> Result<Option<QuizGate>, rusqlite::Error> {
    conn.query_row(
        &format!(
            "SELECT id, max_attempts, allow_retries, is_active, expires_at
             FROM quizzes WHERE {}",
            where_sql
        ),
        [key],
        |row| {
            Ok(QuizGate {
                id: row.get(0)?,
                max_attempts: row.get(1)?,
                allow_retries: row.get::<_, i64>(2)? != 0,
                is_active: row.get::<_, i64>(3)? != 0,
                expires_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// An expired quiz is deactivated in place the first time it is touched
/// past its deadline, then reported as `quiz_expired`.
pub(super) fn check_quiz_expired(
    conn: &Connection,
    quiz: &QuizGate,
    req_id: &str,
) -> Option<serde_json::Value> {
    let expires_at = quiz.expires_at.as_ref()?;
    // RFC 3339 strings order chronologically.
    if *expires_at > Utc::now().to_rfc3339() {
        return None;
    }
    if quiz.is_active {
        let _ = conn.execute("UPDATE quizzes SET is_active = 0 WHERE id = ?", [&quiz.id]);
        tracing::warn!(quiz_id = %quiz.id, %expires_at, "quiz expired, deactivating");
    }
    Some(err(
        req_id,
        "quiz_expired",
        "quiz has expired",
        Some(json!({ "expiresAt": expires_at })),
    ))
}

/// Full gate for joins: expiry first, then the active flag.
pub(super) fn check_quiz_open(
    conn: &Connection,
    quiz: &QuizGate,
    req_id: &str,
) -> Option<serde_json::Value> {
    if let Some(resp) = check_quiz_expired(conn, quiz, req_id) {
        return Some(resp);
    }
    if !quiz.is_active {
        return Some(err(req_id, "quiz_inactive", "quiz is not accepting joins", None));
    }
    None
}

struct ExistingParticipant {
    id: String,
    session_id: String,
    name: String,
    attempt_number: i64,
    ip_address: Option<String>,
    submitted: bool,
}

fn load_quiz_participants(
    conn: &Connection,
    quiz_id: &str,
) -> Result<Vec<ExistingParticipant>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, name, attempt_number, ip_address, submitted_at
         FROM participants WHERE quiz_id = ? ORDER BY rowid",
    )?;
    let rows = stmt.query_map([quiz_id], |row| {
        Ok(ExistingParticipant {
            id: row.get(0)?,
            session_id: row.get(1)?,
            name: row.get(2)?,
            attempt_number: row.get(3)?,
            ip_address: row.get(4)?,
            submitted: row.get::<_, Option<String>>(5)?.is_some(),
        })
    })?;
    rows.collect()
}

fn handle_session_join(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let room_code = match require_str(req, "roomCode") {
        Ok(v) => v.to_uppercase(),
        Err(e) => return e,
    };
    let name = match require_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ip_address = opt_str(req, "ipAddress");
    let device_fingerprint = opt_str(req, "deviceFingerprint");

    let quiz = match load_quiz_gate(conn, "room_code = ?", &room_code) {
        Ok(Some(q)) => q,
        Ok(None) => {
            return err(
                &req.id,
                "quiz_not_found",
                "no quiz with that room code",
                Some(json!({ "roomCode": room_code })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = check_quiz_open(conn, &quiz, &req.id) {
        return resp;
    }

    let existing = match load_quiz_participants(conn, &quiz.id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Re-joining mid-attempt (page refresh, second tab) hands back the
    // in-progress participant instead of minting a duplicate.
    let wanted = normalize_name(&name);
    let same_identity: Vec<&ExistingParticipant> = existing
        .iter()
        .filter(|p| normalize_name(&p.name) == wanted && p.ip_address == ip_address)
        .collect();
    if let Some(open) = same_identity.iter().find(|p| !p.submitted) {
        return ok(
            &req.id,
            json!({
                "sessionId": open.session_id,
                "participantId": open.id,
                "attemptNumber": open.attempt_number,
                "reused": true
            }),
        );
    }
    if !same_identity.is_empty() {
        return err(
            &req.id,
            "session_submitted",
            "previous attempt already submitted; use session.newAttempt",
            Some(json!({
                "attemptNumber": same_identity
                    .iter()
                    .map(|p| p.attempt_number)
                    .max()
            })),
        );
    }

    let participant_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let joined_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO participants(id, quiz_id, session_id, name, attempt_number,
                                  ip_address, device_fingerprint, joined_at, submitted_at)
         VALUES(?, ?, ?, ?, 1, ?, ?, ?, NULL)",
        (
            &participant_id,
            &quiz.id,
            &session_id,
            &name,
            &ip_address,
            &device_fingerprint,
            &joined_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "participants" })),
        );
    }

    ok(
        &req.id,
        json!({
            "sessionId": session_id,
            "participantId": participant_id,
            "attemptNumber": 1,
            "reused": false
        }),
    )
}

fn handle_session_new_attempt(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match require_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current = match conn
        .query_row(
            "SELECT id, quiz_id, name, attempt_number, ip_address, device_fingerprint, submitted_at
             FROM participants WHERE session_id = ?
             ORDER BY rowid DESC LIMIT 1",
            [&session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "session_not_found", "unknown session", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (_, quiz_id, name, attempt_number, ip_address, device_fingerprint, submitted_at) = current;

    let quiz = match load_quiz_gate(conn, "id = ?", &quiz_id) {
        Ok(Some(q)) => q,
        Ok(None) => return err(&req.id, "quiz_not_found", "quiz not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = check_quiz_open(conn, &quiz, &req.id) {
        return resp;
    }
    if !quiz.allow_retries {
        return err(&req.id, "bad_params", "retries are disabled for this quiz", None);
    }
    if submitted_at.is_none() {
        return err(
            &req.id,
            "bad_params",
            "current attempt is still in progress; finalize it first",
            None,
        );
    }
    if attempt_number >= quiz.max_attempts {
        return err(
            &req.id,
            "max_attempts_reached",
            "no attempts left for this quiz",
            Some(json!({ "maxAttempts": quiz.max_attempts })),
        );
    }

    let participant_id = Uuid::new_v4().to_string();
    let new_session_id = Uuid::new_v4().to_string();
    let joined_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO participants(id, quiz_id, session_id, name, attempt_number,
                                  ip_address, device_fingerprint, joined_at, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        (
            &participant_id,
            &quiz_id,
            &new_session_id,
            &name,
            attempt_number + 1,
            &ip_address,
            &device_fingerprint,
            &joined_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "participants" })),
        );
    }

    ok(
        &req.id,
        json!({
            "sessionId": new_session_id,
            "participantId": participant_id,
            "attemptNumber": attempt_number + 1
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "session.join" => Some(handle_session_join(state, req)),
        "session.newAttempt" => Some(handle_session_new_attempt(state, req)),
        _ => None,
    }
}
