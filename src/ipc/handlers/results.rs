use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, require_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, ParticipantMeta, QuestionResult, ResultsView, ScoreRecord};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn load_participant_metas(
    conn: &Connection,
    quiz_id: &str,
) -> Result<Vec<ParticipantMeta>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, name, session_id, attempt_number, submitted_at
         FROM participants WHERE quiz_id = ? ORDER BY rowid",
    )?;
    let rows = stmt.query_map([quiz_id], |row| {
        Ok(ParticipantMeta {
            id: row.get(0)?,
            name: row.get(1)?,
            session_id: row.get(2)?,
            attempt_number: row.get(3)?,
            submitted_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

/// Rehydrate a cached score record. A row whose detail no longer parses is
/// treated as absent so the caller recomputes it.
fn load_cached_record(
    conn: &Connection,
    meta: &ParticipantMeta,
) -> Result<Option<ScoreRecord>, rusqlite::Error> {
    let row = conn
        .query_row(
            "SELECT score, percentage, grade, questions_answered, questions_correct,
                    detail, calculated_at
             FROM score_records WHERE participant_id = ?",
            [&meta.id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((score, percentage, grade, answered, correct, detail_json, calculated_at)) = row
    else {
        return Ok(None);
    };
    let detail: Vec<QuestionResult> = match serde_json::from_str(&detail_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(participant_id = %meta.id, error = %e, "cached score detail unreadable");
            return Ok(None);
        }
    };
    Ok(Some(ScoreRecord {
        participant_id: meta.id.clone(),
        attempt_number: meta.attempt_number,
        score,
        percentage,
        grade,
        questions_answered: answered,
        questions_correct: correct,
        detail,
        calculated_at,
        completed_at: meta.submitted_at.clone(),
    }))
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let quiz_id = match require_str(req, "quizId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mode = opt_str(req, "mode").unwrap_or_else(|| "raw".to_string());
    if mode != "raw" && mode != "forceRecalculate" {
        return err(
            &req.id,
            "bad_params",
            "mode must be raw or forceRecalculate",
            Some(json!({ "mode": mode })),
        );
    }
    let view_str = opt_str(req, "view").unwrap_or_else(|| "attempts".to_string());
    let Some(view) = ResultsView::parse(&view_str) else {
        return err(
            &req.id,
            "bad_params",
            "view must be attempts, best or latest",
            Some(json!({ "view": view_str })),
        );
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM quizzes WHERE id = ?", [&quiz_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "quiz_not_found", "quiz not found", None);
    }

    let questions = match db::load_questions(conn, &quiz_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total = scoring::total_possible_points(&questions);

    let metas = match load_participant_metas(conn, &quiz_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now().to_rfc3339();
    let mut scored: Vec<(ParticipantMeta, ScoreRecord)> = Vec::with_capacity(metas.len());
    for meta in metas {
        let cached = if mode == "forceRecalculate" {
            None
        } else {
            match load_cached_record(conn, &meta) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        };
        let record = match cached {
            Some(r) => r,
            None => {
                let answers = match db::load_answers(conn, &meta.id) {
                    Ok(v) => v,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
                let record = scoring::score_participant(
                    &meta.id,
                    meta.attempt_number,
                    &questions,
                    &answers,
                    meta.submitted_at.as_deref(),
                    &now,
                );
                if let Err(e) = db::upsert_score_record(conn, &record) {
                    return err(
                        &req.id,
                        "db_insert_failed",
                        e.to_string(),
                        Some(json!({ "table": "score_records" })),
                    );
                }
                record
            }
        };
        scored.push((meta, record));
    }

    let aggregate = scoring::aggregate_results(&quiz_id, total, &mode, view, scored);
    match serde_json::to_value(&aggregate) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_participant_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let participant_id = match require_str(req, "participantId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row = match conn
        .query_row(
            "SELECT id, quiz_id, session_id, name, attempt_number, ip_address,
                    joined_at, submitted_at
             FROM participants WHERE id = ?",
            [&participant_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "participant_not_found", "participant not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (id, quiz_id, session_id, name, attempt_number, ip_address, joined_at, submitted_at) = row;

    let answers = match db::load_answers(conn, &id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let answers_json: Vec<serde_json::Value> = answers
        .iter()
        .map(|a| {
            json!({
                "questionId": a.question_id,
                "value": a.value,
                "submittedAt": a.submitted_at
            })
        })
        .collect();

    let meta = ParticipantMeta {
        id: id.clone(),
        name: name.clone(),
        session_id: session_id.clone(),
        attempt_number,
        submitted_at: submitted_at.clone(),
    };
    let score_record = match load_cached_record(conn, &meta) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "participant": {
                "id": id,
                "quizId": quiz_id,
                "sessionId": session_id,
                "name": name,
                "attemptNumber": attempt_number,
                "ipAddress": ip_address,
                "joinedAt": joined_at,
                "submittedAt": submitted_at
            },
            "answers": answers_json,
            "scoreRecord": score_record
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.get" => Some(handle_results_get(state, req)),
        "participant.get" => Some(handle_participant_get(state, req)),
        _ => None,
    }
}
