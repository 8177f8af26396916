//! Storage collaborator.
//!
//! The grading core only talks to persistence through the [`Storage`] trait.
//! [`MemoryStore`] keeps everything in memory and can load/save a JSON
//! snapshot, which is what the command line tool runs against.

pub mod memory;

pub use memory::{MemoryStore, Snapshot};

use crate::error::GradingResult;
use crate::models::{
    Job, JobStatus, OutsiderRecord, ResultRow, RosterEntry, Student, UploadedFile,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// CRUD operations the grading core needs from persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a job, `NotFound` if it does not exist.
    async fn job(&self, job_id: &str) -> GradingResult<Job>;

    async fn jobs(&self) -> GradingResult<Vec<Job>>;

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> GradingResult<()>;

    /// Class id to class name.
    async fn class_names(&self) -> GradingResult<HashMap<String, String>>;

    async fn students_by_class(&self, class_id: &str) -> GradingResult<Vec<Student>>;

    /// Roster snapshot of a job, in persisted order. Empty if none was taken.
    async fn roster(&self, job_id: &str) -> GradingResult<Vec<RosterEntry>>;

    async fn save_roster(&self, job_id: &str, roster: Vec<RosterEntry>) -> GradingResult<()>;

    /// Atomically bind `file` to a roster entry that has no file yet,
    /// together with that student's result rows.
    ///
    /// Returns `Ok(false)` and writes nothing when the entry already holds a
    /// file. On error nothing is written either.
    async fn bind_roster_entry(
        &self,
        job_id: &str,
        student_id: &str,
        file: &UploadedFile,
        rows: Vec<ResultRow>,
    ) -> GradingResult<bool>;

    async fn uploaded_files(&self, job_id: &str) -> GradingResult<Vec<UploadedFile>>;

    /// Attach an uploaded file to a job. Attaching the same path twice is a no-op.
    async fn attach_file(&self, job_id: &str, file: UploadedFile) -> GradingResult<()>;

    async fn read_file(&self, file: &UploadedFile) -> GradingResult<Vec<u8>>;

    async fn outsiders(&self, job_id: &str) -> GradingResult<Vec<OutsiderRecord>>;

    /// Create an outsider together with its result rows, all or nothing.
    async fn add_outsider(&self, outsider: OutsiderRecord, rows: Vec<ResultRow>)
        -> GradingResult<()>;

    async fn result_rows(&self, job_id: &str) -> GradingResult<Vec<ResultRow>>;

    /// Insert or replace the row keyed by `(job_id, entity_id, question_id)`.
    async fn upsert_result_row(&self, row: ResultRow) -> GradingResult<()>;

    /// Write an AI outcome unless the stored row is teacher graded.
    ///
    /// The check and the write happen under one lock. Returns `Ok(false)`
    /// when the row was left alone.
    async fn upsert_ai_result(&self, row: ResultRow) -> GradingResult<bool>;
}
