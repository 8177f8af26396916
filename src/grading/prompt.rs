//! Grading prompt construction and response parsing.

use crate::error::{GradingError, GradingResult};
use crate::models::{GradeSample, Question, SectionedConfig};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

/// Expected shape of one grading pass.
#[derive(Debug, Deserialize)]
struct GradingResponse {
    results: Vec<RawQuestionResult>,
}

#[derive(Debug, Deserialize)]
struct RawQuestionResult {
    question_id: Value,
    #[serde(default)]
    grade: Value,
    #[serde(default)]
    feedback: Option<String>,
}

/// Build the prompt for one grading pass over one student's answers.
///
/// The student's name is deliberately not part of the prompt.
pub fn build_grading_prompt(config: &SectionedConfig, answer_text: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("Grade the student's answers to the following questions.\n\n");
    prompt.push_str("=== QUESTIONS ===\n\n");

    for section in &config.sections {
        if !section.title.is_empty() {
            prompt.push_str(&format!("## {}\n\n", section.title));
        }
        for question in &section.questions {
            prompt.push_str(&format_question(question));
        }
    }

    prompt.push_str("=== STUDENT ANSWERS ===\n\n```\n");
    prompt.push_str(answer_text.trim());
    prompt.push_str("\n```\n\n");

    prompt.push_str("Respond with exactly this JSON shape, one entry per question:\n");
    prompt.push_str(r#"{"results": [{"question_id": "q1", "grade": 7.5, "feedback": "Short justification"}]}"#);
    prompt.push_str("\n\nUse a number between 0 and the question's maximum score for grade, ");
    prompt.push_str("or null if the answer cannot be found.\n");

    prompt
}

fn format_question(question: &Question) -> String {
    let mut block = format!(
        "### Question {} (max score {})\n",
        question.id, question.max_score
    );
    if !question.prompt.is_empty() {
        block.push_str(&format!("{}\n", question.prompt.trim()));
    }
    if let Some(ref rubric) = question.rubric {
        block.push_str(&format!("Rubric: {}\n", rubric.trim()));
    }
    block.push('\n');
    block
}

/// Cut the JSON object out of a response that may be wrapped in prose or
/// a markdown fence.
fn json_body(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn question_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decimal grade from a JSON value. Numbers go through their textual form
/// so `7.2` stays exactly 7.2.
fn grade_value(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => BigDecimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Parse one grading pass into a sample per question id.
///
/// Entries without a usable grade become samples without a value. If the
/// response is not the expected JSON at all the whole pass is rejected with
/// [`GradingError::MalformedAiResponse`].
pub fn parse_grading_response(raw: &str) -> GradingResult<HashMap<String, GradeSample>> {
    let body = json_body(raw).ok_or_else(|| {
        GradingError::MalformedAiResponse("no JSON object in response".to_string())
    })?;

    let response: GradingResponse = serde_json::from_str(body)
        .map_err(|e| GradingError::MalformedAiResponse(e.to_string()))?;

    let mut samples = HashMap::new();
    for result in response.results {
        let Some(id) = question_id(&result.question_id) else {
            continue;
        };
        let comment = result.feedback.unwrap_or_default();
        let sample = match grade_value(&result.grade) {
            Some(value) => GradeSample::new(value, comment),
            None => GradeSample::missing(comment),
        };
        // First answer for a question wins.
        samples.entry(id).or_insert(sample);
    }

    Ok(samples)
}

/// Samples for `questions` from one pass, absent ones filled in as missing.
pub fn samples_for_questions<'a>(
    parsed: GradingResult<HashMap<String, GradeSample>>,
    questions: impl Iterator<Item = &'a Question>,
) -> Vec<(String, GradeSample)> {
    match parsed {
        Ok(mut samples) => questions
            .map(|q| {
                let sample = samples
                    .remove(&q.id)
                    .unwrap_or_else(|| GradeSample::missing("no grade returned"));
                (q.id.clone(), sample)
            })
            .collect(),
        Err(e) => {
            let reason = e.to_string();
            questions
                .map(|q| (q.id.clone(), GradeSample::missing(reason.clone())))
                .collect()
        }
    }
}
