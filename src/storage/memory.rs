//! In-memory storage backed by a JSON snapshot file.

use crate::consensus::accepts_ai_update;
use crate::error::{GradingError, GradingResult};
use crate::models::{
    Class, Job, JobStatus, OutsiderRecord, ResultRow, RosterEntry, Student, UploadedFile,
};
use crate::storage::Storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// Everything the store holds, as persisted on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub classes: Vec<Class>,
    #[serde(default)]
    pub students: Vec<Student>,
    #[serde(default)]
    pub jobs: Vec<Job>,
    /// Roster snapshot per job id.
    #[serde(default)]
    pub rosters: BTreeMap<String, Vec<RosterEntry>>,
    /// Uploaded files per job id.
    #[serde(default)]
    pub uploads: BTreeMap<String, Vec<UploadedFile>>,
    #[serde(default)]
    pub outsiders: Vec<OutsiderRecord>,
    #[serde(default)]
    pub results: Vec<ResultRow>,
}

/// [`Storage`] implementation holding a [`Snapshot`] behind a lock.
///
/// File contents are read from disk unless registered with
/// [`MemoryStore::insert_blob`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store file: {}", path.display()))?;

        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse store file: {}", path.display()))?;

        Ok(Self::new(snapshot))
    }

    /// Write the current state back as pretty JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot().await;
        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write store file: {}", path.display()))?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    /// Serve `path` from memory instead of the filesystem.
    pub async fn insert_blob(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.write().await.insert(path.into(), bytes);
    }
}

fn storage_err(message: impl Into<String>) -> GradingError {
    GradingError::Storage(message.into())
}

fn upsert(results: &mut Vec<ResultRow>, row: ResultRow) {
    match results.iter_mut().find(|r| r.same_key(&row)) {
        Some(existing) => *existing = row,
        None => results.push(row),
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn job(&self, job_id: &str) -> GradingResult<Job> {
        self.inner
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
            .ok_or_else(|| GradingError::not_found("job", job_id))
    }

    async fn jobs(&self) -> GradingResult<Vec<Job>> {
        Ok(self.inner.read().await.jobs.clone())
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus) -> GradingResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| GradingError::not_found("job", job_id))?;
        job.status = status;
        Ok(())
    }

    async fn class_names(&self) -> GradingResult<HashMap<String, String>> {
        Ok(self
            .inner
            .read()
            .await
            .classes
            .iter()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect())
    }

    async fn students_by_class(&self, class_id: &str) -> GradingResult<Vec<Student>> {
        Ok(self
            .inner
            .read()
            .await
            .students
            .iter()
            .filter(|s| s.class_id == class_id)
            .cloned()
            .collect())
    }

    async fn roster(&self, job_id: &str) -> GradingResult<Vec<RosterEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .rosters
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_roster(&self, job_id: &str, roster: Vec<RosterEntry>) -> GradingResult<()> {
        self.inner
            .write()
            .await
            .rosters
            .insert(job_id.to_string(), roster);
        Ok(())
    }

    async fn bind_roster_entry(
        &self,
        job_id: &str,
        student_id: &str,
        file: &UploadedFile,
        rows: Vec<ResultRow>,
    ) -> GradingResult<bool> {
        let mut inner = self.inner.write().await;

        if let Some(row) = rows
            .iter()
            .find(|r| r.job_id != job_id || r.entity_id != student_id)
        {
            return Err(storage_err(format!(
                "result row {}/{} does not belong to student {}",
                row.entity_id, row.question_id, student_id
            )));
        }

        let entry = inner
            .rosters
            .get_mut(job_id)
            .and_then(|roster| roster.iter_mut().find(|e| e.student_id == student_id))
            .ok_or_else(|| GradingError::not_found("roster entry", student_id))?;

        if entry.matched_file_ref.is_some() {
            return Ok(false);
        }

        entry.matched_file_ref = Some(file.clone());
        entry.joined = true;
        for row in rows {
            upsert(&mut inner.results, row);
        }
        Ok(true)
    }

    async fn uploaded_files(&self, job_id: &str) -> GradingResult<Vec<UploadedFile>> {
        Ok(self
            .inner
            .read()
            .await
            .uploads
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn attach_file(&self, job_id: &str, file: UploadedFile) -> GradingResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.jobs.iter().any(|j| j.id == job_id) {
            return Err(GradingError::not_found("job", job_id));
        }

        let files = inner.uploads.entry(job_id.to_string()).or_default();
        if !files.iter().any(|f| f.path == file.path) {
            debug!("Attaching {} to job {}", file.path, job_id);
            files.push(file);
        }
        Ok(())
    }

    async fn read_file(&self, file: &UploadedFile) -> GradingResult<Vec<u8>> {
        if let Some(bytes) = self.blobs.read().await.get(&file.path) {
            return Ok(bytes.clone());
        }

        tokio::fs::read(&file.path)
            .await
            .map_err(|e| storage_err(format!("cannot read {}: {}", file.path, e)))
    }

    async fn outsiders(&self, job_id: &str) -> GradingResult<Vec<OutsiderRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .outsiders
            .iter()
            .filter(|o| o.origin_job_id == job_id)
            .cloned()
            .collect())
    }

    async fn add_outsider(
        &self,
        outsider: OutsiderRecord,
        rows: Vec<ResultRow>,
    ) -> GradingResult<()> {
        let mut inner = self.inner.write().await;

        // Validate everything before touching state so a failure leaves nothing behind.
        if inner.outsiders.iter().any(|o| o.id == outsider.id) {
            return Err(storage_err(format!("outsider {} already exists", outsider.id)));
        }
        if rows.is_empty() {
            return Err(storage_err(format!(
                "outsider {} must be created with at least one result row",
                outsider.id
            )));
        }
        if let Some(row) = rows
            .iter()
            .find(|r| r.entity_id != outsider.id || r.job_id != outsider.origin_job_id)
        {
            return Err(storage_err(format!(
                "result row {}/{} does not belong to outsider {}",
                row.entity_id, row.question_id, outsider.id
            )));
        }
        if let Some(row) = rows
            .iter()
            .find(|r| inner.results.iter().any(|existing| existing.same_key(r)))
        {
            return Err(storage_err(format!(
                "result row {}/{} already exists",
                row.entity_id, row.question_id
            )));
        }

        debug!(
            "Creating outsider {} with {} result rows",
            outsider.id,
            rows.len()
        );
        inner.outsiders.push(outsider);
        inner.results.extend(rows);
        Ok(())
    }

    async fn result_rows(&self, job_id: &str) -> GradingResult<Vec<ResultRow>> {
        Ok(self
            .inner
            .read()
            .await
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn upsert_result_row(&self, row: ResultRow) -> GradingResult<()> {
        upsert(&mut self.inner.write().await.results, row);
        Ok(())
    }

    async fn upsert_ai_result(&self, row: ResultRow) -> GradingResult<bool> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.results.iter().find(|r| r.same_key(&row)) {
            if !accepts_ai_update(existing.status) {
                debug!(
                    "Keeping teacher grade of {}/{} in job {}",
                    row.entity_id, row.question_id, row.job_id
                );
                return Ok(false);
            }
        }
        upsert(&mut inner.results, row);
        Ok(true)
    }
}
