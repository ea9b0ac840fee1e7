use crate::db;
use crate::identity::{resolve_participant, RequestIdentity};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, require_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, is_answered};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct SubmissionTarget {
    participant_id: String,
    quiz_id: String,
    attempt_number: i64,
    submitted_at: Option<String>,
}

/// Resolve a session id to exactly one participant row. Duplicate rows for
/// one session are possible (double joins); the identity module picks one.
fn resolve_target(
    conn: &Connection,
    req: &Request,
    session_id: &str,
) -> Result<SubmissionTarget, serde_json::Value> {
    let candidates = db::load_session_candidates(conn, session_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let ctx = RequestIdentity {
        ip_address: opt_str(req, "ipAddress"),
        device_fingerprint: opt_str(req, "deviceFingerprint"),
    };
    let participant_id = resolve_participant(&candidates, &ctx)
        .map_err(|e| err(&req.id, &e.code, e.message.clone(), e.details.clone()))?;

    conn.query_row(
        "SELECT quiz_id, attempt_number, submitted_at FROM participants WHERE id = ?",
        [&participant_id],
        |row| {
            Ok(SubmissionTarget {
                participant_id: participant_id.clone(),
                quiz_id: row.get(0)?,
                attempt_number: row.get(1)?,
                submitted_at: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "participant_not_found", "participant row missing", None))
}

fn answers_count(conn: &Connection, participant_id: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM answers WHERE participant_id = ?",
        [participant_id],
        |r| r.get(0),
    )
}

fn handle_answer_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match require_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_id = match require_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let value = req.params.get("value").cloned().unwrap_or(serde_json::Value::Null);
    if value.is_array() || value.is_object() {
        return err(&req.id, "bad_params", "value must be a JSON scalar", None);
    }

    let target = match resolve_target(conn, req, &session_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if target.submitted_at.is_some() {
        return err(
            &req.id,
            "session_submitted",
            "attempt already submitted",
            None,
        );
    }

    let quiz = match super::sessions::load_quiz_gate(conn, "id = ?", &target.quiz_id) {
        Ok(Some(q)) => q,
        Ok(None) => return err(&req.id, "quiz_not_found", "quiz not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = super::sessions::check_quiz_expired(conn, &quiz, &req.id) {
        return resp;
    }

    let question_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM questions WHERE id = ? AND quiz_id = ?",
            (&question_id, &target.quiz_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if question_ok.is_none() {
        return err(&req.id, "question_not_found", "question not in this quiz", None);
    }

    // A blank value is dropped rather than stored; it must not count as an
    // answer and must not clobber a previous real one.
    if !is_answered(&value) {
        let count = match answers_count(conn, &target.participant_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        return ok(&req.id, json!({ "accepted": false, "answersCount": count }));
    }

    let answer_id = Uuid::new_v4().to_string();
    let submitted_at = Utc::now().to_rfc3339();
    let value_json = value.to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO answers(id, participant_id, question_id, value, submitted_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(participant_id, question_id) DO UPDATE SET
           value = excluded.value,
           submitted_at = excluded.submitted_at",
        (
            &answer_id,
            &target.participant_id,
            &question_id,
            &value_json,
            &submitted_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "answers" })),
        );
    }

    let count = match answers_count(conn, &target.participant_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "accepted": true, "answersCount": count }))
}

fn handle_submission_finalize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session_id = match require_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let target = match resolve_target(conn, req, &session_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let questions = match db::load_questions(conn, &target.quiz_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let answers = match db::load_answers(conn, &target.participant_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now().to_rfc3339();
    let mut record = scoring::score_participant(
        &target.participant_id,
        target.attempt_number,
        &questions,
        &answers,
        target.submitted_at.as_deref(),
        &now,
    );
    // Explicitly finalizing a partial attempt stamps it now; a fully
    // answered attempt keeps its last answer's timestamp.
    let final_submitted = record
        .completed_at
        .clone()
        .unwrap_or_else(|| now.clone());
    record.completed_at = Some(final_submitted.clone());

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE participants SET submitted_at = ?
         WHERE id = ? AND submitted_at IS NULL",
        (&final_submitted, &target.participant_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = db::upsert_score_record(&tx, &record) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "score_records" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    match serde_json::to_value(&record) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "answer.submit" => Some(handle_answer_submit(state, req)),
        "submission.finalize" => Some(handle_submission_finalize(state, req)),
        _ => None,
    }
}
