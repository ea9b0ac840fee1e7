use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_quizd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn quizd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

struct Quiz {
    quiz_id: String,
    room_code: String,
    question_ids: Vec<String>,
}

fn setup_quiz(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    params: serde_json::Value,
) -> Quiz {
    let created = request_ok(stdin, reader, "create", "quiz.create", params);
    let quiz_id = created["quizId"].as_str().expect("quizId").to_string();
    let room_code = created["roomCode"].as_str().expect("roomCode").to_string();
    let got = request_ok(stdin, reader, "get", "quiz.get", json!({ "quizId": quiz_id }));
    let question_ids = got["questions"]
        .as_array()
        .expect("questions")
        .iter()
        .map(|q| q["id"].as_str().expect("question id").to_string())
        .collect();
    Quiz {
        quiz_id,
        room_code,
        question_ids,
    }
}

fn answer_and_finalize(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    session_id: &str,
    question_ids: &[String],
    values: &[serde_json::Value],
) -> serde_json::Value {
    for (i, value) in values.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("ans-{}-{}", session_id, i),
            "answer.submit",
            json!({ "sessionId": session_id, "questionId": question_ids[i], "value": value }),
        );
    }
    request_ok(
        stdin,
        reader,
        &format!("fin-{}", session_id),
        "submission.finalize",
        json!({ "sessionId": session_id }),
    )
}

#[test]
fn best_and_latest_views_fold_attempts_per_student() {
    let workspace = temp_dir("quizd-attempts-views");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let quiz = setup_quiz(
        &mut stdin,
        &mut reader,
        json!({
            "title": "Two Tries",
            "allowRetries": true,
            "maxAttempts": 2,
            "questions": [
                {
                    "text": "First",
                    "kind": "multiple_choice",
                    "options": ["a", "b"],
                    "correctAnswer": 0,
                    "points": 1
                },
                {
                    "text": "Second",
                    "kind": "multiple_choice",
                    "options": ["a", "b"],
                    "correctAnswer": 0,
                    "points": 1
                }
            ]
        }),
    );

    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "session.join",
        json!({ "roomCode": quiz.room_code, "name": "Riley" }),
    );
    let session1 = joined["sessionId"].as_str().expect("sessionId").to_string();
    assert_eq!(joined["attemptNumber"], json!(1));

    // A retry cannot start while the current attempt is open.
    let premature = request(
        &mut stdin,
        &mut reader,
        "early",
        "session.newAttempt",
        json!({ "sessionId": session1 }),
    );
    assert_eq!(premature["ok"], json!(false));
    assert_eq!(premature["error"]["code"], json!("bad_params"));

    let first = answer_and_finalize(
        &mut stdin,
        &mut reader,
        &session1,
        &quiz.question_ids,
        &[json!(0), json!(0)],
    );
    assert_eq!(first["score"], json!(2));

    let retry = request_ok(
        &mut stdin,
        &mut reader,
        "retry",
        "session.newAttempt",
        json!({ "sessionId": session1 }),
    );
    let session2 = retry["sessionId"].as_str().expect("sessionId").to_string();
    assert_eq!(retry["attemptNumber"], json!(2));
    assert_ne!(session1, session2);

    // The second attempt regresses so the two views disagree.
    let second = answer_and_finalize(
        &mut stdin,
        &mut reader,
        &session2,
        &quiz.question_ids,
        &[json!(0), json!(1)],
    );
    assert_eq!(second["score"], json!(1));

    let attempts = request_ok(
        &mut stdin,
        &mut reader,
        "r-att",
        "results.get",
        json!({ "quizId": quiz.quiz_id, "view": "attempts" }),
    );
    let listed = attempts["participants"].as_array().expect("participants");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["attemptNumber"], json!(1));
    assert_eq!(listed[0]["score"], json!(2));
    assert_eq!(listed[1]["attemptNumber"], json!(2));
    assert_eq!(listed[1]["score"], json!(1));
    assert_eq!(attempts["averageScore"], json!(1.5));
    assert_eq!(attempts["averagePercentage"], json!(75.0));

    let best = request_ok(
        &mut stdin,
        &mut reader,
        "r-best",
        "results.get",
        json!({ "quizId": quiz.quiz_id, "view": "best" }),
    );
    let best_listed = best["participants"].as_array().expect("participants");
    assert_eq!(best_listed.len(), 1);
    assert_eq!(best_listed[0]["attemptNumber"], json!(1));
    assert_eq!(best_listed[0]["score"], json!(2));
    assert_eq!(best_listed[0]["grade"], json!("A"));

    let latest = request_ok(
        &mut stdin,
        &mut reader,
        "r-latest",
        "results.get",
        json!({ "quizId": quiz.quiz_id, "view": "latest" }),
    );
    let latest_listed = latest["participants"].as_array().expect("participants");
    assert_eq!(latest_listed.len(), 1);
    assert_eq!(latest_listed[0]["attemptNumber"], json!(2));
    assert_eq!(latest_listed[0]["score"], json!(1));
    assert_eq!(latest_listed[0]["percentage"], json!(50.0));

    let exhausted = request(
        &mut stdin,
        &mut reader,
        "third",
        "session.newAttempt",
        json!({ "sessionId": session2 }),
    );
    assert_eq!(exhausted["ok"], json!(false));
    assert_eq!(exhausted["error"]["code"], json!("max_attempts_reached"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn new_attempt_requires_retries_enabled() {
    let workspace = temp_dir("quizd-attempts-noretry");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let quiz = setup_quiz(
        &mut stdin,
        &mut reader,
        json!({
            "title": "One Shot",
            "questions": [
                {
                    "text": "Only question",
                    "kind": "true_false",
                    "correctAnswer": 1,
                    "points": 1
                }
            ]
        }),
    );

    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "session.join",
        json!({ "roomCode": quiz.room_code, "name": "Sam" }),
    );
    let session_id = joined["sessionId"].as_str().expect("sessionId").to_string();
    let _ = answer_and_finalize(
        &mut stdin,
        &mut reader,
        &session_id,
        &quiz.question_ids,
        &[json!(1)],
    );

    let denied = request(
        &mut stdin,
        &mut reader,
        "retry",
        "session.newAttempt",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(denied["ok"], json!(false));
    assert_eq!(denied["error"]["code"], json!("bad_params"));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "ghost",
        "session.newAttempt",
        json!({ "sessionId": "no-such-session" }),
    );
    assert_eq!(unknown["ok"], json!(false));
    assert_eq!(unknown["error"]["code"], json!("session_not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
