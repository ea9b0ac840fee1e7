use anyhow::anyhow;
use rusqlite::Connection;
use std::path::Path;

use crate::identity::ParticipantCandidate;
use crate::scoring::{AnswerRow, QuestionDef, QuestionKind, ScoreRecord};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("quizd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            room_code TEXT NOT NULL UNIQUE,
            max_attempts INTEGER NOT NULL DEFAULT 1,
            allow_retries INTEGER NOT NULL DEFAULT 0,
            randomize_questions INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            expires_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            kind TEXT NOT NULL,
            options TEXT NOT NULL,
            correct_answer TEXT,
            points INTEGER NOT NULL,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id),
            UNIQUE(quiz_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_quiz ON questions(quiz_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_quiz_idx ON questions(quiz_id, idx)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participants(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            ip_address TEXT,
            device_fingerprint TEXT,
            joined_at TEXT NOT NULL,
            submitted_at TEXT,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_quiz ON participants(quiz_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_session ON participants(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_quiz_name ON participants(quiz_id, name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answers(
            id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            value TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY(participant_id) REFERENCES participants(id),
            UNIQUE(participant_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answers_participant ON answers(participant_id)",
        [],
    )?;

    // Derived scoring fields live in their own table, never on the
    // participant row. A missing row means "not calculated yet".
    conn.execute(
        "CREATE TABLE IF NOT EXISTS score_records(
            participant_id TEXT PRIMARY KEY,
            score INTEGER NOT NULL,
            percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            questions_answered INTEGER NOT NULL,
            questions_correct INTEGER NOT NULL,
            detail TEXT NOT NULL,
            calculated_at TEXT NOT NULL,
            FOREIGN KEY(participant_id) REFERENCES participants(id)
        )",
        [],
    )?;

    // Older workspaces predate device correlation. Add the column if needed.
    ensure_participants_device_fingerprint(&conn)?;

    Ok(conn)
}

/// Load a quiz's questions in declaration order as scoring inputs.
pub fn load_questions(conn: &Connection, quiz_id: &str) -> anyhow::Result<Vec<QuestionDef>> {
    let mut stmt = conn.prepare(
        "SELECT id, idx, text, kind, options, correct_answer, points
         FROM questions WHERE quiz_id = ? ORDER BY idx",
    )?;
    let raw = stmt
        .query_map([quiz_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, idx, text, kind, options, correct_answer, points)| {
            let kind = QuestionKind::parse(&kind)
                .ok_or_else(|| anyhow!("unknown question kind in store: {}", kind))?;
            let options: Vec<String> = serde_json::from_str(&options).unwrap_or_default();
            let correct_answer = correct_answer
                .as_deref()
                .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());
            Ok(QuestionDef {
                id,
                idx,
                text,
                kind,
                options,
                correct_answer,
                points,
            })
        })
        .collect()
}

/// Load a participant's stored answers in submission order.
pub fn load_answers(conn: &Connection, participant_id: &str) -> anyhow::Result<Vec<AnswerRow>> {
    let mut stmt = conn.prepare(
        "SELECT question_id, value, submitted_at
         FROM answers WHERE participant_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([participant_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .map(|(question_id, value, submitted_at)| AnswerRow {
            question_id,
            value: serde_json::from_str(&value)
                .unwrap_or(serde_json::Value::String(value)),
            submitted_at,
        })
        .collect())
}

/// All participant rows sharing a session id, oldest first, with their
/// answer counts. Input to duplicate-session resolution.
pub fn load_session_candidates(
    conn: &Connection,
    session_id: &str,
) -> anyhow::Result<Vec<ParticipantCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.ip_address, p.device_fingerprint, p.rowid,
                (SELECT COUNT(*) FROM answers a WHERE a.participant_id = p.id)
         FROM participants p WHERE p.session_id = ? ORDER BY p.rowid",
    )?;
    let rows = stmt
        .query_map([session_id], |row| {
            Ok(ParticipantCandidate {
                id: row.get(0)?,
                ip_address: row.get(1)?,
                device_fingerprint: row.get(2)?,
                created_seq: row.get(3)?,
                answer_count: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Cache a computed score record, replacing any previous calculation for
/// the participant.
pub fn upsert_score_record(conn: &Connection, record: &ScoreRecord) -> anyhow::Result<()> {
    let detail = serde_json::to_string(&record.detail)?;
    conn.execute(
        "INSERT INTO score_records(participant_id, score, percentage, grade,
                                   questions_answered, questions_correct, detail, calculated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(participant_id) DO UPDATE SET
           score = excluded.score,
           percentage = excluded.percentage,
           grade = excluded.grade,
           questions_answered = excluded.questions_answered,
           questions_correct = excluded.questions_correct,
           detail = excluded.detail,
           calculated_at = excluded.calculated_at",
        (
            &record.participant_id,
            record.score,
            record.percentage,
            &record.grade,
            record.questions_answered,
            record.questions_correct,
            &detail,
            &record.calculated_at,
        ),
    )?;
    Ok(())
}

fn ensure_participants_device_fingerprint(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "participants", "device_fingerprint")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE participants ADD COLUMN device_fingerprint TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
