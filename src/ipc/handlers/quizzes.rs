use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_bool, opt_i64, opt_str, require_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring::QuestionKind;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct QuestionInput {
    text: String,
    kind: QuestionKind,
    options: Vec<String>,
    correct_answer: Option<serde_json::Value>,
    points: i64,
}

fn bad(message: impl Into<String>, details: Option<serde_json::Value>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details,
    }
}

/// Validate the `questions` param array into storable rows. Choice kinds
/// need options and an in-range integer correct index; short answers may
/// carry free reference text.
fn parse_questions(raw: &serde_json::Value) -> Result<Vec<QuestionInput>, HandlerErr> {
    let Some(items) = raw.as_array() else {
        return Err(bad("questions must be an array", None));
    };
    if items.is_empty() {
        return Err(bad("questions must not be empty", None));
    }

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let at = json!({ "index": i });
        let text = item
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad("question text is required", Some(at.clone())))?;

        let kind_str = item
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("multiple_choice");
        let kind = QuestionKind::parse(kind_str).ok_or_else(|| {
            bad(
                "kind must be one of: multiple_choice, true_false, short_answer",
                Some(json!({ "index": i, "kind": kind_str })),
            )
        })?;

        let options: Vec<String> = item
            .get("options")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        let points = item.get("points").and_then(|v| v.as_i64()).unwrap_or(1);
        if points <= 0 {
            return Err(bad(
                "points must be a positive integer",
                Some(json!({ "index": i, "points": points })),
            ));
        }

        let correct_answer = item.get("correctAnswer").cloned().filter(|v| !v.is_null());

        match kind {
            QuestionKind::MultipleChoice => {
                if options.len() < 2 {
                    return Err(bad(
                        "multiple_choice questions need at least two options",
                        Some(at),
                    ));
                }
                let idx = correct_answer
                    .as_ref()
                    .and_then(choice_index)
                    .ok_or_else(|| {
                        bad("correctAnswer must be an option index", Some(at.clone()))
                    })?;
                if idx < 0 || idx as usize >= options.len() {
                    return Err(bad(
                        "correctAnswer index out of range",
                        Some(json!({ "index": i, "correctAnswer": idx })),
                    ));
                }
            }
            QuestionKind::TrueFalse => {
                let idx = correct_answer
                    .as_ref()
                    .and_then(choice_index)
                    .ok_or_else(|| {
                        bad("correctAnswer must be 0 (true) or 1 (false)", Some(at.clone()))
                    })?;
                if !(0..=1).contains(&idx) {
                    return Err(bad(
                        "correctAnswer must be 0 (true) or 1 (false)",
                        Some(json!({ "index": i, "correctAnswer": idx })),
                    ));
                }
            }
            QuestionKind::ShortAnswer => {}
        }

        out.push(QuestionInput {
            text,
            kind,
            options,
            correct_answer,
            points,
        });
    }
    Ok(out)
}

fn choice_index(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Six characters from the tail of a fresh uuid, mapped onto an unambiguous
/// uppercase alphabet. Collisions are retried against the UNIQUE column.
fn generate_room_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
    let id = Uuid::new_v4();
    id.as_bytes()
        .iter()
        .rev()
        .take(6)
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

fn fresh_room_code(conn: &Connection) -> Result<String, HandlerErr> {
    for _ in 0..16 {
        let code = generate_room_code();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM quizzes WHERE room_code = ?",
                [&code],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        if taken.is_none() {
            return Ok(code);
        }
    }
    Err(HandlerErr {
        code: "db_insert_failed",
        message: "could not allocate an unused room code".to_string(),
        details: None,
    })
}

fn insert_questions(
    conn: &Connection,
    quiz_id: &str,
    questions: &[QuestionInput],
    ids: &[String],
) -> Result<i64, HandlerErr> {
    let mut total_points: i64 = 0;
    for (i, q) in questions.iter().enumerate() {
        let options_json = serde_json::to_string(&q.options).unwrap_or_else(|_| "[]".to_string());
        let correct_json = q
            .correct_answer
            .as_ref()
            .map(|v| v.to_string());
        conn.execute(
            "INSERT INTO questions(id, quiz_id, idx, text, kind, options, correct_answer, points)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &ids[i],
                quiz_id,
                i as i64,
                &q.text,
                q.kind.as_str(),
                &options_json,
                &correct_json,
                q.points,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "questions" })),
        })?;
        total_points += q.points;
    }
    Ok(total_points)
}

fn handle_quiz_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let title = match require_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = opt_str(req, "description");
    let questions = match parse_questions(
        req.params.get("questions").unwrap_or(&serde_json::Value::Null),
    ) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let max_attempts = opt_i64(req, "maxAttempts").unwrap_or(1).max(1);
    let allow_retries = opt_bool(req, "allowRetries").unwrap_or(false);
    let randomize_questions = opt_bool(req, "randomizeQuestions").unwrap_or(false);
    let expires_at = opt_str(req, "expiresAt");

    let quiz_id = Uuid::new_v4().to_string();
    let room_code = match fresh_room_code(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let created_at = Utc::now().to_rfc3339();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "INSERT INTO quizzes(id, title, description, room_code, max_attempts,
                             allow_retries, randomize_questions, is_active, expires_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &quiz_id,
            &title,
            &description,
            &room_code,
            max_attempts,
            allow_retries as i64,
            randomize_questions as i64,
            &expires_at,
            &created_at,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quizzes" })),
        );
    }

    let ids: Vec<String> = questions
        .iter()
        .map(|_| Uuid::new_v4().to_string())
        .collect();
    let total_points = match insert_questions(&tx, &quiz_id, &questions, &ids) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "quizId": quiz_id,
            "roomCode": room_code,
            "questionCount": questions.len(),
            "totalPossiblePoints": total_points
        }),
    )
}

fn handle_quiz_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "quizzes": [] }));
    };

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           q.id,
           q.title,
           q.room_code,
           q.is_active,
           q.expires_at,
           q.created_at,
           (SELECT COUNT(*) FROM questions qq WHERE qq.quiz_id = q.id) AS question_count,
           (SELECT COUNT(*) FROM participants p WHERE p.quiz_id = q.id) AS participant_count
         FROM quizzes q
         ORDER BY q.created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let room_code: String = row.get(2)?;
            let is_active: i64 = row.get(3)?;
            let expires_at: Option<String> = row.get(4)?;
            let created_at: String = row.get(5)?;
            let question_count: i64 = row.get(6)?;
            let participant_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "title": title,
                "roomCode": room_code,
                "isActive": is_active != 0,
                "expiresAt": expires_at,
                "createdAt": created_at,
                "questionCount": question_count,
                "participantCount": participant_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(quizzes) => ok(&req.id, json!({ "quizzes": quizzes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn load_quiz_questions(
    conn: &Connection,
    quiz_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, idx, text, kind, options, correct_answer, points
             FROM questions WHERE quiz_id = ? ORDER BY idx",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    stmt.query_map([quiz_id], |row| {
        let id: String = row.get(0)?;
        let idx: i64 = row.get(1)?;
        let text: String = row.get(2)?;
        let kind: String = row.get(3)?;
        let options: String = row.get(4)?;
        let correct_answer: Option<String> = row.get(5)?;
        let points: i64 = row.get(6)?;
        Ok(json!({
            "id": id,
            "idx": idx,
            "text": text,
            "kind": kind,
            "options": serde_json::from_str::<serde_json::Value>(&options)
                .unwrap_or_else(|_| json!([])),
            "correctAnswer": correct_answer
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            "points": points
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_quiz_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let quiz_id = match require_str(req, "quizId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let quiz = match conn
        .query_row(
            "SELECT id, title, description, room_code, max_attempts, allow_retries,
                    randomize_questions, is_active, expires_at, created_at
             FROM quizzes WHERE id = ?",
            [&quiz_id],
            |row| {
                let id: String = row.get(0)?;
                let title: String = row.get(1)?;
                let description: Option<String> = row.get(2)?;
                let room_code: String = row.get(3)?;
                let max_attempts: i64 = row.get(4)?;
                let allow_retries: i64 = row.get(5)?;
                let randomize_questions: i64 = row.get(6)?;
                let is_active: i64 = row.get(7)?;
                let expires_at: Option<String> = row.get(8)?;
                let created_at: String = row.get(9)?;
                Ok(json!({
                    "id": id,
                    "title": title,
                    "description": description,
                    "roomCode": room_code,
                    "maxAttempts": max_attempts,
                    "allowRetries": allow_retries != 0,
                    "randomizeQuestions": randomize_questions != 0,
                    "isActive": is_active != 0,
                    "expiresAt": expires_at,
                    "createdAt": created_at
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "quiz_not_found", "quiz not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let questions = match load_quiz_questions(conn, &quiz_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut result = quiz;
    result["questions"] = json!(questions);
    ok(&req.id, result)
}

fn handle_quiz_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let quiz_id = match require_str(req, "quizId") {
        Ok(v) => v,
        Err(e) => return e,
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

    let new_questions = match req.params.get("questions") {
        Some(raw) if !raw.is_null() => match parse_questions(raw) {
            Ok(v) => Some(v),
            Err(e) => return e.response(&req.id),
        },
        _ => None,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Some(title) = opt_str(req, "title") {
        if let Err(e) = tx.execute(
            "UPDATE quizzes SET title = ? WHERE id = ?",
            (&title, &quiz_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(description) = opt_str(req, "description") {
        if let Err(e) = tx.execute(
            "UPDATE quizzes SET description = ? WHERE id = ?",
            (&description, &quiz_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(max_attempts) = opt_i64(req, "maxAttempts") {
        if let Err(e) = tx.execute(
            "UPDATE quizzes SET max_attempts = ? WHERE id = ?",
            (max_attempts.max(1), &quiz_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(allow_retries) = opt_bool(req, "allowRetries") {
        if let Err(e) = tx.execute(
            "UPDATE quizzes SET allow_retries = ? WHERE id = ?",
            (allow_retries as i64, &quiz_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let mut question_count: Option<usize> = None;
    if let Some(questions) = new_questions {
        // Keep the id of any question whose position and kind survive the
        // edit, so answers already stored against it keep matching exactly.
        let old: Vec<(String, String)> = match tx
            .prepare("SELECT id, kind FROM questions WHERE quiz_id = ? ORDER BY idx")
            .and_then(|mut s| {
                s.query_map([&quiz_id], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            }) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };

        let ids: Vec<String> = questions
            .iter()
            .enumerate()
            .map(|(i, q)| match old.get(i) {
                Some((old_id, old_kind)) if old_kind == q.kind.as_str() => old_id.clone(),
                _ => Uuid::new_v4().to_string(),
            })
            .collect();

        if let Err(e) = tx.execute("DELETE FROM questions WHERE quiz_id = ?", [&quiz_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "questions" })),
            );
        }
        if let Err(e) = insert_questions(&tx, &quiz_id, &questions, &ids) {
            let _ = tx.rollback();
            return e.response(&req.id);
        }
        question_count = Some(questions.len());
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "quizId": quiz_id,
            "questionCount": question_count
        }),
    )
}

fn handle_quiz_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let quiz_id = match require_str(req, "quizId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(is_active) = opt_bool(req, "isActive") else {
        return err(&req.id, "bad_params", "missing isActive", None);
    };

    let changed = match conn.execute(
        "UPDATE quizzes SET is_active = ? WHERE id = ?",
        (is_active as i64, &quiz_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "quiz_not_found", "quiz not found", None);
    }
    ok(&req.id, json!({ "ok": true, "isActive": is_active }))
}

fn handle_quiz_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let quiz_id = match require_str(req, "quizId") {
        Ok(v) => v,
        Err(e) => return e,
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

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Delete in dependency order (no ON DELETE CASCADE).
    for (sql, table) in [
        (
            "DELETE FROM score_records
             WHERE participant_id IN (SELECT id FROM participants WHERE quiz_id = ?)",
            "score_records",
        ),
        (
            "DELETE FROM answers
             WHERE participant_id IN (SELECT id FROM participants WHERE quiz_id = ?)",
            "answers",
        ),
        ("DELETE FROM participants WHERE quiz_id = ?", "participants"),
        ("DELETE FROM questions WHERE quiz_id = ?", "questions"),
        ("DELETE FROM quizzes WHERE id = ?", "quizzes"),
    ] {
        if let Err(e) = tx.execute(sql, [&quiz_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "quiz.create" => Some(handle_quiz_create(state, req)),
        "quiz.list" => Some(handle_quiz_list(state, req)),
        "quiz.get" => Some(handle_quiz_get(state, req)),
        "quiz.update" => Some(handle_quiz_update(state, req)),
        "quiz.setActive" => Some(handle_quiz_set_active(state, req)),
        "quiz.delete" => Some(handle_quiz_delete(state, req)),
        _ => None,
    }
}
