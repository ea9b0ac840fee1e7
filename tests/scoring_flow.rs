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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
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

fn create_quiz(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    questions: serde_json::Value,
) -> Quiz {
    let created = request_ok(
        stdin,
        reader,
        "create",
        "quiz.create",
        json!({ "title": "Scoring Flow", "questions": questions }),
    );
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

#[test]
fn mixed_question_kinds_score_to_full_marks() {
    let workspace = temp_dir("quizd-scoring-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let quiz = create_quiz(
        &mut stdin,
        &mut reader,
        json!([
            {
                "text": "Pick the second option",
                "kind": "multiple_choice",
                "options": ["alpha", "beta", "gamma", "delta"],
                "correctAnswer": 1,
                "points": 2
            },
            {
                "text": "Pick the third option",
                "kind": "multiple_choice",
                "options": ["x", "y", "z"],
                "correctAnswer": "2",
                "points": 2
            },
            {
                "text": "Water is wet",
                "kind": "true_false",
                "correctAnswer": 0,
                "points": 1
            },
            {
                "text": "Name the powerhouse of the cell",
                "kind": "short_answer",
                "points": 1
            }
        ]),
    );

    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "session.join",
        json!({ "roomCode": quiz.room_code, "name": "Jordan" }),
    );
    let session_id = joined["sessionId"].as_str().expect("sessionId").to_string();
    let participant_id = joined["participantId"]
        .as_str()
        .expect("participantId")
        .to_string();

    // Numeric index, string index, string-for-number, free text: all four
    // client shapes seen in the wild.
    for (i, value) in [
        json!(1),
        json!("2"),
        json!("0"),
        json!("The mitochondria"),
    ]
    .into_iter()
    .enumerate()
    {
        let resp = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "answer.submit",
            json!({
                "sessionId": session_id,
                "questionId": quiz.question_ids[i],
                "value": value
            }),
        );
        assert_eq!(resp["accepted"], json!(true));
        assert_eq!(resp["answersCount"], json!(i as i64 + 1));
    }

    let record = request_ok(
        &mut stdin,
        &mut reader,
        "fin",
        "submission.finalize",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(record["score"], json!(6));
    assert_eq!(record["percentage"], json!(100.0));
    assert_eq!(record["grade"], json!("A"));
    assert_eq!(record["questionsAnswered"], json!(4));
    assert_eq!(record["questionsCorrect"], json!(4));

    let detail = record["detail"].as_array().expect("detail");
    assert_eq!(detail.len(), 4);
    assert!(
        detail[0].get("matchedBy").is_none(),
        "exact matches carry no matchedBy flag"
    );
    assert_eq!(detail[3]["pendingReview"], json!(true));
    assert_eq!(detail[0]["pendingReview"], json!(false));

    // Every question was answered before an explicit submit, so the
    // completion timestamp is the last answer's, and it is persisted as
    // the participant's submission time.
    let completed_at = record["completedAt"].as_str().expect("completedAt").to_string();
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "pg",
        "participant.get",
        json!({ "participantId": participant_id }),
    );
    assert_eq!(
        fetched["participant"]["submittedAt"].as_str(),
        Some(completed_at.as_str())
    );
    let last_answer_at = fetched["answers"]
        .as_array()
        .expect("answers")
        .iter()
        .map(|a| a["submittedAt"].as_str().expect("answer ts"))
        .max()
        .expect("latest answer ts");
    assert_eq!(completed_at, last_answer_at);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn half_correct_attempt_lands_on_b() {
    let workspace = temp_dir("quizd-scoring-half");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let quiz = create_quiz(
        &mut stdin,
        &mut reader,
        json!([
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
        ]),
    );

    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "session.join",
        json!({ "roomCode": quiz.room_code, "name": "Sam" }),
    );
    let session_id = joined["sessionId"].as_str().expect("sessionId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a0",
        "answer.submit",
        json!({ "sessionId": session_id, "questionId": quiz.question_ids[0], "value": 0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "answer.submit",
        json!({ "sessionId": session_id, "questionId": quiz.question_ids[1], "value": 1 }),
    );

    let record = request_ok(
        &mut stdin,
        &mut reader,
        "fin",
        "submission.finalize",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(record["score"], json!(1));
    assert_eq!(record["percentage"], json!(50.0));
    assert_eq!(record["grade"], json!("B"));
    assert_eq!(record["questionsCorrect"], json!(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn finalize_is_idempotent_on_scoring_fields() {
    let workspace = temp_dir("quizd-scoring-idem");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let quiz = create_quiz(
        &mut stdin,
        &mut reader,
        json!([
            {
                "text": "Only question",
                "kind": "true_false",
                "correctAnswer": 1,
                "points": 3
            }
        ]),
    );
    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "join",
        "session.join",
        json!({ "roomCode": quiz.room_code, "name": "Alex" }),
    );
    let session_id = joined["sessionId"].as_str().expect("sessionId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a0",
        "answer.submit",
        json!({ "sessionId": session_id, "questionId": quiz.question_ids[0], "value": 1 }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "fin1",
        "submission.finalize",
        json!({ "sessionId": session_id }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "fin2",
        "submission.finalize",
        json!({ "sessionId": session_id }),
    );

    for field in [
        "score",
        "percentage",
        "grade",
        "questionsAnswered",
        "questionsCorrect",
        "completedAt",
        "detail",
    ] {
        assert_eq!(first[field], second[field], "field {} drifted", field);
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
