use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::identity::normalize_name;

/// Grade thresholds are inclusive lower bounds: >=80 A, >=50 B, >=30 C,
/// else F. Fixed grading policy; results comparisons depend on it.
pub fn grade_for(percentage: f64) -> &'static str {
    if percentage >= 80.0 {
        "A"
    } else if percentage >= 50.0 {
        "B"
    } else if percentage >= 30.0 {
        "C"
    } else {
        "F"
    }
}

pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ScoringError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
}

impl QuestionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "multiple_choice" => Some(Self::MultipleChoice),
            "true_false" => Some(Self::TrueFalse),
            "short_answer" => Some(Self::ShortAnswer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::TrueFalse => "true_false",
            Self::ShortAnswer => "short_answer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionDef {
    pub id: String,
    pub idx: i64,
    pub text: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
    pub correct_answer: Option<serde_json::Value>,
    pub points: i64,
}

#[derive(Debug, Clone)]
pub struct AnswerRow {
    pub question_id: String,
    pub value: serde_json::Value,
    pub submitted_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Exact,
    Position,
    Suffix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub question_id: String,
    pub student_answer: serde_json::Value,
    pub correct_answer: serde_json::Value,
    pub is_correct: bool,
    pub points_earned: i64,
    pub answered: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub matched_by: Option<MatchedBy>,
    pub pending_review: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub participant_id: String,
    pub attempt_number: i64,
    pub score: i64,
    pub percentage: f64,
    pub grade: String,
    pub questions_answered: i64,
    pub questions_correct: i64,
    pub detail: Vec<QuestionResult>,
    pub calculated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParticipantMeta {
    pub id: String,
    pub name: String,
    pub session_id: String,
    pub attempt_number: i64,
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultsView {
    Attempts,
    Best,
    Latest,
}

impl ResultsView {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attempts" => Some(Self::Attempts),
            "best" => Some(Self::Best),
            "latest" => Some(Self::Latest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempts => "attempts",
            Self::Best => "best",
            Self::Latest => "latest",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub name: String,
    pub session_id: String,
    pub attempt_number: i64,
    pub score: i64,
    pub percentage: f64,
    pub grade: String,
    pub questions_answered: i64,
    pub questions_correct: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    pub calculated_at: String,
    pub detail: Vec<QuestionResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsAggregate {
    pub quiz_id: String,
    pub mode: String,
    pub view: String,
    pub total_possible_points: i64,
    pub participants: Vec<ParticipantSummary>,
    pub average_score: f64,
    pub average_percentage: f64,
    pub pass_count: i64,
    pub fail_count: i64,
}

pub fn total_possible_points(questions: &[QuestionDef]) -> i64 {
    questions.iter().map(|q| q.points).sum()
}

/// An answer counts as given only when its value carries content: null is
/// no answer, and strings must be non-empty after trimming.
pub fn is_answered(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Locate the participant's answer for a question. Exact id match is the
/// primary strategy; positional and suffix matching only exist to survive
/// stores where ids drifted between client and server versions, and both
/// are flagged to the caller and logged.
pub fn find_answer<'a>(
    question: &QuestionDef,
    answers: &'a [AnswerRow],
) -> Option<(&'a AnswerRow, MatchedBy)> {
    if let Some(a) = answers.iter().find(|a| a.question_id == question.id) {
        return Some((a, MatchedBy::Exact));
    }

    if let Some(a) = answers.get(question.idx as usize) {
        tracing::warn!(
            question_id = %question.id,
            answer_question_id = %a.question_id,
            idx = question.idx,
            "answer matched positionally; stored question ids do not line up"
        );
        return Some((a, MatchedBy::Position));
    }

    if let Some(a) = answers.iter().find(|a| {
        a.question_id.ends_with(&question.id)
            || question.id.ends_with(&a.question_id)
            || a.question_id.contains(&question.id)
    }) {
        tracing::warn!(
            question_id = %question.id,
            answer_question_id = %a.question_id,
            "answer matched by id suffix; stored question ids do not line up"
        );
        return Some((a, MatchedBy::Suffix));
    }

    None
}

/// Accept integers and numeric-looking strings as a choice index. Clients
/// have historically sent both `0` and `"0"` for the same selection.
fn normalize_choice_index(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub is_correct: bool,
    pub points_earned: i64,
}

/// Decide correctness for one answered question.
///
/// Short-answer questions are auto-graded as "attempted, pending manual
/// review": any non-blank response earns the points. The percentage
/// pipeline treats that as a real score, so callers surface
/// `pendingReview` on the per-question detail.
pub fn evaluate(question: &QuestionDef, answer: &AnswerRow) -> Evaluation {
    let is_correct = match question.kind {
        QuestionKind::MultipleChoice | QuestionKind::TrueFalse => {
            let given = normalize_choice_index(&answer.value);
            let expected = question
                .correct_answer
                .as_ref()
                .and_then(normalize_choice_index);
            match (given, expected) {
                (Some(g), Some(e)) => g == e,
                _ => false,
            }
        }
        QuestionKind::ShortAnswer => match &answer.value {
            serde_json::Value::String(s) => !s.trim().is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        },
    };

    Evaluation {
        is_correct,
        points_earned: if is_correct { question.points } else { 0 },
    }
}

/// Score one participant attempt against a quiz's question list.
///
/// Deterministic and side-effect-free: questions are walked in declaration
/// order (presentation shuffling is cosmetic), and the same inputs always
/// produce the identical record. `calculated_at` is supplied by the caller
/// so recomputation under a pinned clock is bit-identical.
pub fn score_participant(
    participant_id: &str,
    attempt_number: i64,
    questions: &[QuestionDef],
    answers: &[AnswerRow],
    submitted_at: Option<&str>,
    calculated_at: &str,
) -> ScoreRecord {
    let total_possible = total_possible_points(questions);

    let mut score: i64 = 0;
    let mut questions_answered: i64 = 0;
    let mut questions_correct: i64 = 0;
    let mut detail: Vec<QuestionResult> = Vec::with_capacity(questions.len());

    for question in questions {
        let found = find_answer(question, answers);
        let answered = found
            .map(|(a, _)| is_answered(&a.value))
            .unwrap_or(false);

        let correct_answer = question
            .correct_answer
            .clone()
            .unwrap_or(serde_json::Value::Null);

        if !answered {
            // Unanswered: zero points, not counted as answered, and never
            // counted as incorrect for the answered statistics.
            detail.push(QuestionResult {
                question_id: question.id.clone(),
                student_answer: serde_json::Value::Null,
                correct_answer,
                is_correct: false,
                points_earned: 0,
                answered: false,
                matched_by: None,
                pending_review: false,
            });
            continue;
        }

        let (answer, matched_by) = found.expect("answered implies a match");
        let eval = evaluate(question, answer);

        questions_answered += 1;
        if eval.is_correct {
            questions_correct += 1;
        }
        score += eval.points_earned;

        detail.push(QuestionResult {
            question_id: question.id.clone(),
            student_answer: answer.value.clone(),
            correct_answer,
            is_correct: eval.is_correct,
            points_earned: eval.points_earned,
            answered: true,
            matched_by: match matched_by {
                MatchedBy::Exact => None,
                other => Some(other),
            },
            pending_review: question.kind == QuestionKind::ShortAnswer,
        });
    }

    let percentage = if total_possible > 0 {
        round_off_2_decimals((score as f64 / total_possible as f64) * 100.0)
    } else {
        0.0
    };

    // Auto-submission keeps the real completion time: when the last
    // question was answered, not when the recalculation happened to run.
    let completed_at = match submitted_at {
        Some(ts) => Some(ts.to_string()),
        None => {
            let all_answered =
                !questions.is_empty() && questions_answered == questions.len() as i64;
            if all_answered {
                answers
                    .iter()
                    .filter(|a| is_answered(&a.value))
                    .map(|a| a.submitted_at.as_str())
                    .max()
                    .map(|ts| ts.to_string())
            } else {
                None
            }
        }
    };

    ScoreRecord {
        participant_id: participant_id.to_string(),
        attempt_number,
        score,
        percentage,
        grade: grade_for(percentage).to_string(),
        questions_answered,
        questions_correct,
        detail,
        calculated_at: calculated_at.to_string(),
        completed_at,
    }
}

/// Best attempt: highest score, ties broken by the earliest attempt.
pub fn best_attempt<'a>(records: &'a [ScoreRecord]) -> Option<&'a ScoreRecord> {
    records
        .iter()
        .min_by_key(|r| (std::cmp::Reverse(r.score), r.attempt_number))
}

/// Latest attempt: highest attempt number, regardless of score.
pub fn latest_attempt<'a>(records: &'a [ScoreRecord]) -> Option<&'a ScoreRecord> {
    records.iter().max_by_key(|r| r.attempt_number)
}

/// Assemble the per-quiz results payload from already-scored attempts.
///
/// The "attempts" view reports every attempt; "best" and "latest" keep one
/// attempt per identity (normalized name). Averages are taken over the
/// reported list: `averageScore` over raw points and `averagePercentage`
/// over percentages, kept apart by name.
pub fn aggregate_results(
    quiz_id: &str,
    total_possible: i64,
    mode: &str,
    view: ResultsView,
    scored: Vec<(ParticipantMeta, ScoreRecord)>,
) -> ResultsAggregate {
    let reported: Vec<(ParticipantMeta, ScoreRecord)> = match view {
        ResultsView::Attempts => scored,
        ResultsView::Best | ResultsView::Latest => {
            let mut by_identity: HashMap<String, Vec<(ParticipantMeta, ScoreRecord)>> =
                HashMap::new();
            let mut order: Vec<String> = Vec::new();
            for (meta, record) in scored {
                let key = normalize_name(&meta.name);
                if !by_identity.contains_key(&key) {
                    order.push(key.clone());
                }
                by_identity.entry(key).or_default().push((meta, record));
            }
            order
                .into_iter()
                .filter_map(|key| {
                    let group = by_identity.remove(&key)?;
                    let records: Vec<ScoreRecord> =
                        group.iter().map(|(_, r)| r.clone()).collect();
                    let pick = match view {
                        ResultsView::Latest => latest_attempt(&records)?,
                        _ => best_attempt(&records)?,
                    };
                    let picked_attempt = pick.attempt_number;
                    group
                        .into_iter()
                        .find(|(_, r)| r.attempt_number == picked_attempt)
                })
                .collect()
        }
    };

    let mut participants: Vec<ParticipantSummary> = Vec::with_capacity(reported.len());
    let mut score_sum: f64 = 0.0;
    let mut percentage_sum: f64 = 0.0;
    let mut pass_count: i64 = 0;

    for (meta, record) in &reported {
        score_sum += record.score as f64;
        percentage_sum += record.percentage;
        if record.grade != "F" {
            pass_count += 1;
        }
        participants.push(ParticipantSummary {
            participant_id: meta.id.clone(),
            name: meta.name.clone(),
            session_id: meta.session_id.clone(),
            attempt_number: record.attempt_number,
            score: record.score,
            percentage: record.percentage,
            grade: record.grade.clone(),
            questions_answered: record.questions_answered,
            questions_correct: record.questions_correct,
            submitted_at: meta.submitted_at.clone(),
            calculated_at: record.calculated_at.clone(),
            detail: record.detail.clone(),
        });
    }

    let count = participants.len() as f64;
    let (average_score, average_percentage) = if participants.is_empty() {
        (0.0, 0.0)
    } else {
        (
            round_off_2_decimals(score_sum / count),
            round_off_2_decimals(percentage_sum / count),
        )
    };

    ResultsAggregate {
        quiz_id: quiz_id.to_string(),
        mode: mode.to_string(),
        view: view.as_str().to_string(),
        total_possible_points: total_possible,
        fail_count: participants.len() as i64 - pass_count,
        pass_count,
        participants,
        average_score,
        average_percentage,
    }
}
