//! Error types for the grading core.
//!
//! Each variant maps onto one failure class the pipeline distinguishes:
//! some are surfaced to the caller, others are recovered per item and only
//! recorded in the run report.

use bigdecimal::BigDecimal;
use thiserror::Error;

/// Errors produced by the matcher, grading pipeline, aggregator and storage.
#[derive(Debug, Error)]
pub enum GradingError {
    /// A job, student, entity or question does not exist. Not retried.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The AI grader answered with something that is not the expected JSON.
    #[error("malformed AI grading response: {0}")]
    MalformedAiResponse(String),

    /// The AI grader could not be reached or returned an error status.
    #[error("AI grader request failed: {0}")]
    Grader(String),

    /// Text could not be extracted from one uploaded file.
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// A storage operation failed; nothing was written.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A teacher edit outside `[0, max_score]`.
    #[error("grade {grade} for question {question_id} is outside [0, {max_score}]")]
    InvalidGrade {
        question_id: String,
        grade: BigDecimal,
        max_score: BigDecimal,
    },
}

impl GradingError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        GradingError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type GradingResult<T> = std::result::Result<T, GradingError>;
