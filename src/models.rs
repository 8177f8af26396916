//! Data models for the grading core.
//!
//! This module contains the value types shared by the consensus finalizer,
//! the document matcher and the results aggregator, plus the report shapes
//! they hand back to the command line layer.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One AI pass's opinion on one question.
///
/// `value` is `None` when the pass did not produce a usable number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSample {
    pub value: Option<BigDecimal>,
    pub comment: String,
}

impl GradeSample {
    pub fn new(value: BigDecimal, comment: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            comment: comment.into(),
        }
    }

    /// A sample for a pass that failed to produce a grade.
    pub fn missing(comment: impl Into<String>) -> Self {
        Self {
            value: None,
            comment: comment.into(),
        }
    }
}

/// Lifecycle status of a single result cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Placeholder created at job initialisation, not graded yet.
    Pending,
    /// AI passes agreed on a grade.
    AiGraded,
    /// AI passes disagreed or were missing; a human has to look at it.
    PendingReview,
    /// A teacher set the grade explicitly. Final.
    TeacherGraded,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Pending => write!(f, "Pending"),
            ResultStatus::AiGraded => write!(f, "AI graded"),
            ResultStatus::PendingReview => write!(f, "Pending review"),
            ResultStatus::TeacherGraded => write!(f, "Teacher graded"),
        }
    }
}

impl ResultStatus {
    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "⏳",
            ResultStatus::AiGraded => "🤖",
            ResultStatus::PendingReview => "🟠",
            ResultStatus::TeacherGraded => "✅",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ResultStatus::Pending)
    }
}

/// Which actor produced the authoritative grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizedBy {
    Ai,
    Teacher,
}

/// Outcome of reconciling grade samples (or of a teacher override).
///
/// `PendingReview` never carries a grade or a finalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub status: ResultStatus,
    pub grade: Option<BigDecimal>,
    pub finalized_by: Option<FinalizedBy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ConsensusResult {
    pub fn pending_review() -> Self {
        Self {
            status: ResultStatus::PendingReview,
            grade: None,
            finalized_by: None,
            feedback: None,
        }
    }

    pub fn ai_graded(grade: BigDecimal, feedback: Option<String>) -> Self {
        Self {
            status: ResultStatus::AiGraded,
            grade: Some(grade),
            finalized_by: Some(FinalizedBy::Ai),
            feedback,
        }
    }

    pub fn teacher_graded(grade: BigDecimal, feedback: Option<String>) -> Self {
        Self {
            status: ResultStatus::TeacherGraded,
            grade: Some(grade),
            finalized_by: Some(FinalizedBy::Teacher),
            feedback,
        }
    }
}

/// A class as known to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub name: String,
}

/// A student on a class roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub class_id: String,
}

/// An uploaded answer document attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadedFile {
    pub path: String,
    pub content_type: String,
}

/// Expected participant snapshot for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub student_id: String,
    pub name: String,
    #[serde(default)]
    pub joined: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_file_ref: Option<UploadedFile>,
}

impl From<&Student> for RosterEntry {
    fn from(student: &Student) -> Self {
        Self {
            student_id: student.id.clone(),
            name: student.name.clone(),
            joined: false,
            matched_file_ref: None,
        }
    }
}

/// A student who submitted work but was not on the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutsiderRecord {
    pub id: String,
    pub name: String,
    pub origin_job_id: String,
}

/// A single gradable question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub max_score: BigDecimal,
    #[serde(default)]
    pub prompt: String,
    /// Optional marking guidance passed to the AI grader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,
}

/// A titled group of questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub title: String,
    pub questions: Vec<Question>,
}

/// Canonical, sectioned assessment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionedConfig {
    pub sections: Vec<Section>,
}

impl SectionedConfig {
    /// All questions across all sections, in configuration order.
    pub fn questions(&self) -> impl Iterator<Item = &Question> {
        self.sections.iter().flat_map(|s| s.questions.iter())
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions().find(|q| q.id == question_id)
    }
}

/// Assessment configuration as persisted: either the current sectioned
/// shape or an older flat list of questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssessmentConfig {
    Sectioned(SectionedConfig),
    Flat(Vec<Question>),
}

/// Lifecycle state of a grading job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Draft,
    Matching,
    Grading,
    Completed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Draft => write!(f, "Draft"),
            JobStatus::Matching => write!(f, "Matching"),
            JobStatus::Grading => write!(f, "Grading"),
            JobStatus::Completed => write!(f, "Completed"),
        }
    }
}

/// One assessment-grading run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub class_id: String,
    #[serde(default)]
    pub status: JobStatus,
    pub config: AssessmentConfig,
}

/// A persisted per-question result row, keyed by `(job_id, entity_id, question_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub job_id: String,
    pub entity_id: String,
    pub question_id: String,
    pub grade: Option<BigDecimal>,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_by: Option<FinalizedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<UploadedFile>,
}

impl ResultRow {
    /// Creates an ungraded placeholder row.
    pub fn pending(job_id: &str, entity_id: &str, question_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            entity_id: entity_id.to_string(),
            question_id: question_id.to_string(),
            grade: None,
            status: ResultStatus::Pending,
            feedback: None,
            finalized_by: None,
            file: None,
        }
    }

    pub fn same_key(&self, other: &ResultRow) -> bool {
        self.job_id == other.job_id
            && self.entity_id == other.entity_id
            && self.question_id == other.question_id
    }

    /// Overwrites grade, status, feedback and finalizer with a consensus outcome.
    pub fn apply(&mut self, result: ConsensusResult) {
        self.grade = result.grade;
        self.status = result.status;
        self.finalized_by = result.finalized_by;
        self.feedback = result.feedback;
    }

    pub fn cell(&self) -> ResultCell {
        ResultCell {
            grade: self.grade.clone(),
            status: self.status,
            feedback: self.feedback.clone(),
        }
    }
}

/// One `(entity, question)` cell of the result matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCell {
    pub grade: Option<BigDecimal>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Default for ResultCell {
    fn default() -> Self {
        Self {
            grade: None,
            status: ResultStatus::Pending,
            feedback: None,
        }
    }
}

/// Whether an entity came from the roster or was created as an outsider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Roster,
    Outsider,
}

/// A gradable participant: roster student or outsider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
}

impl From<&RosterEntry> for Entity {
    fn from(entry: &RosterEntry) -> Self {
        Self {
            id: entry.student_id.clone(),
            name: entry.name.clone(),
            kind: EntityKind::Roster,
        }
    }
}

impl From<&OutsiderRecord> for Entity {
    fn from(outsider: &OutsiderRecord) -> Self {
        Self {
            id: outsider.id.clone(),
            name: outsider.name.clone(),
            kind: EntityKind::Outsider,
        }
    }
}

/// Progress counters of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Distinct entities with at least one result row.
    pub total: usize,
    /// Entities none of whose rows are still pending.
    pub processed: usize,
}

/// Per-job progress summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    pub class_name: String,
    pub status: JobStatus,
    pub progress: Progress,
}

/// Class- and question-level analytics, as percentages of max score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analytics {
    /// `None` when no entity has a graded question yet.
    pub class_average: Option<BigDecimal>,
    /// Number of entities contributing to `class_average`.
    pub graded_entities: usize,
    pub performance_by_question: std::collections::BTreeMap<String, Option<BigDecimal>>,
}

/// Results of one entity across all configured questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResults {
    pub entity: Entity,
    /// `(question_id, cell)` in configuration order.
    pub cells: Vec<(String, ResultCell)>,
    /// Exact sum of the non-null grades.
    pub total: BigDecimal,
    pub max_total: BigDecimal,
}

impl EntityResults {
    pub fn pending_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|(_, cell)| {
                matches!(
                    cell.status,
                    ResultStatus::Pending | ResultStatus::PendingReview
                )
            })
            .count()
    }
}

/// Reviewer-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub summary: JobSummary,
    pub questions: Vec<Question>,
    pub entities: Vec<EntityResults>,
    pub analytics: Analytics,
}

/// A file bound to a roster student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundFile {
    pub file: UploadedFile,
    pub student_id: String,
    pub student_name: String,
}

/// A file that produced a new outsider record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutsiderFile {
    pub file: UploadedFile,
    pub outsider: OutsiderRecord,
}

/// A file that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFailure {
    pub file: UploadedFile,
    pub error: String,
}

/// Outcome of matching a job's uploaded files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub job_id: String,
    pub bound: Vec<BoundFile>,
    pub outsiders: Vec<OutsiderFile>,
    /// Files already bound by an earlier run.
    pub skipped: Vec<UploadedFile>,
    pub failures: Vec<FileFailure>,
}

impl MatchReport {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            ..Self::default()
        }
    }

    /// Number of files the run looked at.
    pub fn files_seen(&self) -> usize {
        self.bound.len() + self.outsiders.len() + self.skipped.len() + self.failures.len()
    }
}

/// Grading outcome for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityGrading {
    pub entity_id: String,
    pub ai_graded: usize,
    pub pending_review: usize,
    /// Questions left alone because a teacher already graded them.
    pub teacher_locked: usize,
    /// Per-entity problems (extraction, grader transport, malformed responses).
    pub errors: Vec<String>,
}

/// Outcome of grading a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingReport {
    pub job_id: String,
    pub entities: Vec<EntityGrading>,
    /// Entities with result rows but no bound answer document.
    pub unbound_entities: usize,
}

impl GradingReport {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            ..Self::default()
        }
    }

    pub fn ai_graded(&self) -> usize {
        self.entities.iter().map(|e| e.ai_graded).sum()
    }

    pub fn pending_review(&self) -> usize {
        self.entities.iter().map(|e| e.pending_review).sum()
    }
}

/// Metadata about a command line run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    /// Snapshot file the run worked on.
    pub store: String,
    pub model_used: String,
    pub passes: usize,
    /// Human readable agreement band.
    pub tolerance: String,
    pub duration_seconds: f64,
}

/// Everything one run did to one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub overview: Overview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<MatchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grading: Option<GradingReport>,
}

impl JobRun {
    /// Cells the AI passes could not agree on.
    pub fn review_count(&self) -> usize {
        self.overview
            .entities
            .iter()
            .flat_map(|e| e.cells.iter())
            .filter(|(_, cell)| cell.status == ResultStatus::PendingReview)
            .count()
    }
}

/// The complete report of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: ReportMetadata,
    pub jobs: Vec<JobRun>,
}

impl RunReport {
    pub fn review_count(&self) -> usize {
        self.jobs.iter().map(JobRun::review_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_flat_config_deserializes() {
        let json = r#"[{"id": "q1", "max_score": "10"}, {"id": "q2", "max_score": "5"}]"#;
        let config: AssessmentConfig = serde_json::from_str(json).unwrap();
        match config {
            AssessmentConfig::Flat(questions) => assert_eq!(questions.len(), 2),
            other => panic!("expected flat config, got {:?}", other),
        }
    }

    #[test]
    fn test_sectioned_config_deserializes() {
        let json = r#"{"sections": [{"title": "A", "questions": [{"id": "q1", "max_score": "10"}]}]}"#;
        let config: AssessmentConfig = serde_json::from_str(json).unwrap();
        match config {
            AssessmentConfig::Sectioned(sectioned) => {
                assert_eq!(sectioned.sections[0].title, "A");
                assert!(sectioned.question("q1").is_some());
            }
            other => panic!("expected sectioned config, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_review_has_no_grade() {
        let result = ConsensusResult::pending_review();
        assert_eq!(result.status, ResultStatus::PendingReview);
        assert!(result.grade.is_none());
        assert!(result.finalized_by.is_none());
    }

    #[test]
    fn test_row_apply_overwrites_previous_grade() {
        let mut row = ResultRow::pending("job", "s1", "q1");
        row.apply(ConsensusResult::ai_graded(
            BigDecimal::from_str("7.5").unwrap(),
            Some("fine".to_string()),
        ));
        assert_eq!(row.status, ResultStatus::AiGraded);
        assert_eq!(row.finalized_by, Some(FinalizedBy::Ai));

        row.apply(ConsensusResult::pending_review());
        assert!(row.grade.is_none());
        assert!(row.feedback.is_none());
    }

    #[test]
    fn test_status_pending_only_for_placeholders() {
        assert!(ResultStatus::Pending.is_pending());
        assert!(!ResultStatus::PendingReview.is_pending());
        assert!(!ResultStatus::AiGraded.is_pending());
        assert!(!ResultStatus::TeacherGraded.is_pending());
    }

    #[test]
    fn test_match_report_counts_files() {
        let file = UploadedFile {
            path: "a.txt".to_string(),
            content_type: "text/plain".to_string(),
        };
        let mut report = MatchReport::new("job");
        report.skipped.push(file.clone());
        report.failures.push(FileFailure {
            file,
            error: "boom".to_string(),
        });
        assert_eq!(report.files_seen(), 2);
    }
}
