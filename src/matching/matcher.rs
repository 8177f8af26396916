//! Document matcher.
//!
//! Extracts the text of every uploaded file of a job and binds the file to
//! the first roster student whose full name appears in it. Files nobody on
//! the roster claims become outsider records.

use crate::analysis::normalize_config;
use crate::error::GradingResult;
use crate::extract::TextExtractor;
use crate::matching::roster::ensure_roster;
use crate::models::{
    BoundFile, FileFailure, JobStatus, MatchReport, OutsiderFile, OutsiderRecord, ResultRow,
    RosterEntry, UploadedFile,
};
use crate::storage::Storage;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the matcher.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Namespace prefix of outsider ids.
    pub outsider_id_prefix: String,
    /// Display name prefix, followed by a running number.
    pub outsider_name_prefix: String,
    /// Files extracted concurrently.
    pub extraction_concurrency: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            outsider_id_prefix: "outsider::".to_string(),
            outsider_name_prefix: "Outsider".to_string(),
            extraction_concurrency: 4,
        }
    }
}

/// Lowercase and collapse whitespace so line breaks in scanned text still match.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Roster entries still free to take a file whose name occurs in `text`,
/// in roster order.
fn matching_entries<'a>(
    roster: &'a [RosterEntry],
    text: &str,
) -> impl Iterator<Item = &'a RosterEntry> {
    let haystack = normalize(text);
    roster.iter().filter(move |entry| {
        let name = normalize(&entry.name);
        entry.matched_file_ref.is_none() && !name.is_empty() && haystack.contains(&name)
    })
}

/// The roster entry a document with `text` belongs to, if any.
///
/// Plain case-insensitive substring containment of the full name. The first
/// eligible entry in roster order wins; entries that already hold a file
/// are skipped.
pub fn find_roster_match<'a>(roster: &'a [RosterEntry], text: &str) -> Option<&'a RosterEntry> {
    matching_entries(roster, text).next()
}

/// Binds uploaded documents of a job to roster students or new outsiders.
///
/// Runs for the same job are serialized; different jobs match concurrently.
pub struct DocumentMatcher {
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn TextExtractor>,
    config: MatcherConfig,
    job_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentMatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn TextExtractor>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            storage,
            extractor,
            config,
            job_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn job_lock(&self, job_id: &str) -> Arc<Mutex<()>> {
        self.job_locks
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }

    /// Match every not yet bound file of `job_id`.
    ///
    /// Fails only if the job itself cannot be loaded. Problems with single
    /// files end up in [`MatchReport::failures`] and the remaining files are
    /// still processed.
    pub async fn match_files(&self, job_id: &str) -> GradingResult<MatchReport> {
        let lock = self.job_lock(job_id).await;
        let _guard = lock.lock().await;

        let job = self.storage.job(job_id).await?;
        let question_ids: Vec<String> = normalize_config(&job.config)
            .questions()
            .map(|q| q.id.clone())
            .collect();
        let mut roster = ensure_roster(self.storage.as_ref(), &job).await?;
        let rows = self.storage.result_rows(job_id).await?;

        if job.status == JobStatus::Draft {
            self.storage
                .update_job_status(job_id, JobStatus::Matching)
                .await?;
        }

        let bound_paths: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.file.as_ref())
            .chain(roster.iter().filter_map(|e| e.matched_file_ref.as_ref()))
            .map(|f| f.path.clone())
            .collect();

        let mut report = MatchReport::new(job_id);
        let (skipped, files): (Vec<UploadedFile>, Vec<UploadedFile>) = self
            .storage
            .uploaded_files(job_id)
            .await?
            .into_iter()
            .partition(|f| bound_paths.contains(&f.path));
        report.skipped = skipped;

        info!(
            "Job {}: matching {} files against {} roster students ({} already bound)",
            job_id,
            files.len(),
            roster.len(),
            report.skipped.len()
        );

        // Extraction runs concurrently; binding below stays in upload order.
        let extracted: Vec<(UploadedFile, GradingResult<String>)> = stream::iter(files)
            .map(|file| async move {
                let text = self.extract_text(&file).await;
                (file, text)
            })
            .buffered(self.config.extraction_concurrency.max(1))
            .collect()
            .await;

        let mut outsider_count = self.storage.outsiders(job_id).await?.len();

        for (file, text) in extracted {
            let text = match text {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping {}: {}", file.path, e);
                    report.failures.push(FileFailure {
                        file,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self
                .bind_to_roster(job_id, &mut roster, &question_ids, &rows, &file, &text)
                .await
            {
                Ok(Some(entry)) => {
                    info!("Bound {} to {}", file.path, entry.name);
                    report.bound.push(BoundFile {
                        file,
                        student_id: entry.student_id,
                        student_name: entry.name,
                    });
                }
                Ok(None) => {
                    match self
                        .create_outsider(job_id, outsider_count + 1, &question_ids, &file)
                        .await
                    {
                        Ok(outsider) => {
                            outsider_count += 1;
                            info!("No roster match for {}, created {}", file.path, outsider.name);
                            report.outsiders.push(OutsiderFile { file, outsider });
                        }
                        Err(e) => {
                            warn!("Could not create outsider for {}: {}", file.path, e);
                            report.failures.push(FileFailure {
                                file,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                Err(e) => {
                    warn!("Could not bind {}: {}", file.path, e);
                    report.failures.push(FileFailure {
                        file,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn extract_text(&self, file: &UploadedFile) -> GradingResult<String> {
        let bytes = self.storage.read_file(file).await?;
        let text = self.extractor.extract(&bytes, &file.content_type).await?;
        debug!("Extracted {} characters from {}", text.len(), file.path);
        Ok(text)
    }

    /// Bind `file` and its result rows to the first free roster entry named
    /// in `text`. `Ok(None)` when nobody matches.
    async fn bind_to_roster(
        &self,
        job_id: &str,
        roster: &mut [RosterEntry],
        question_ids: &[String],
        rows: &[ResultRow],
        file: &UploadedFile,
        text: &str,
    ) -> GradingResult<Option<RosterEntry>> {
        let candidates: Vec<String> = matching_entries(roster, text)
            .map(|e| e.student_id.clone())
            .collect();

        for student_id in candidates {
            let bound_rows = question_ids
                .iter()
                .map(|question_id| {
                    let mut row = rows
                        .iter()
                        .find(|r| r.entity_id == student_id && &r.question_id == question_id)
                        .cloned()
                        .unwrap_or_else(|| ResultRow::pending(job_id, &student_id, question_id));
                    row.file = Some(file.clone());
                    row
                })
                .collect();

            let claimed = self
                .storage
                .bind_roster_entry(job_id, &student_id, file, bound_rows)
                .await?;

            let Some(entry) = roster.iter_mut().find(|e| e.student_id == student_id) else {
                continue;
            };
            // Claimed or not, the entry is no longer free for this run.
            entry.matched_file_ref = Some(file.clone());
            if !claimed {
                debug!("{} already holds a document, trying next match", entry.name);
                continue;
            }
            entry.joined = true;

            return Ok(Some(entry.clone()));
        }

        Ok(None)
    }

    /// Create outsider number `seq` with one pending row per question, bound to `file`.
    async fn create_outsider(
        &self,
        job_id: &str,
        seq: usize,
        question_ids: &[String],
        file: &UploadedFile,
    ) -> GradingResult<OutsiderRecord> {
        let outsider = OutsiderRecord {
            id: format!("{}{}", self.config.outsider_id_prefix, Uuid::new_v4().simple()),
            name: format!("{} {}", self.config.outsider_name_prefix, seq),
            origin_job_id: job_id.to_string(),
        };

        let rows = question_ids
            .iter()
            .map(|question_id| {
                let mut row = ResultRow::pending(job_id, &outsider.id, question_id);
                row.file = Some(file.clone());
                row
            })
            .collect();

        self.storage.add_outsider(outsider.clone(), rows).await?;
        Ok(outsider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GradingError;
    use crate::extract::PlainTextExtractor;
    use crate::models::{AssessmentConfig, Job, OutsiderRecord, Question, Student};
    use crate::storage::{MemoryStore, Snapshot};
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn entry(id: &str, name: &str) -> RosterEntry {
        RosterEntry {
            student_id: id.to_string(),
            name: name.to_string(),
            joined: false,
            matched_file_ref: None,
        }
    }

    fn text_file(path: &str) -> UploadedFile {
        UploadedFile {
            path: path.to_string(),
            content_type: "text/plain".to_string(),
        }
    }

    fn job(questions: &[&str]) -> Job {
        Job {
            id: "j1".to_string(),
            name: "Essay".to_string(),
            class_id: "c1".to_string(),
            status: JobStatus::Draft,
            config: AssessmentConfig::Flat(
                questions
                    .iter()
                    .map(|id| Question {
                        id: id.to_string(),
                        max_score: BigDecimal::from(10),
                        prompt: String::new(),
                        rubric: None,
                    })
                    .collect(),
            ),
        }
    }

    async fn setup(
        roster: Vec<RosterEntry>,
        files: &[(&str, &str)],
    ) -> (Arc<MemoryStore>, DocumentMatcher) {
        let snapshot = Snapshot {
            jobs: vec![job(&["q1", "q2"])],
            rosters: [("j1".to_string(), roster)].into_iter().collect(),
            uploads: [(
                "j1".to_string(),
                files.iter().map(|(path, _)| text_file(path)).collect(),
            )]
            .into_iter()
            .collect(),
            ..Snapshot::default()
        };
        let store = Arc::new(MemoryStore::new(snapshot));
        for (path, content) in files {
            store.insert_blob(*path, content.as_bytes().to_vec()).await;
        }
        crate::matching::initialize_job(store.as_ref(), "j1").await.unwrap();

        let matcher = DocumentMatcher::new(
            store.clone(),
            Arc::new(PlainTextExtractor),
            MatcherConfig::default(),
        );
        (store, matcher)
    }

    #[test]
    fn test_find_roster_match_is_case_insensitive() {
        let roster = vec![entry("s1", "Sam Roe"), entry("s2", "Alex Doe")];
        let found = find_roster_match(&roster, "some text containing the name alex doe here");
        assert_eq!(found.map(|e| e.student_id.as_str()), Some("s2"));
    }

    #[test]
    fn test_find_roster_match_handles_line_breaks() {
        let roster = vec![entry("s1", "Alex  Doe")];
        assert!(find_roster_match(&roster, "NAME: ALEX\n DOE\nAnswer 1 ...").is_some());
    }

    #[test]
    fn test_find_roster_match_uses_roster_order() {
        let roster = vec![entry("s1", "Sam Roe"), entry("s2", "Alex Doe")];
        let found = find_roster_match(&roster, "alex doe helped sam roe");
        assert_eq!(found.map(|e| e.student_id.as_str()), Some("s1"));
    }

    #[test]
    fn test_find_roster_match_skips_claimed_and_blank_names() {
        let mut claimed = entry("s1", "Alex Doe");
        claimed.matched_file_ref = Some(text_file("first.txt"));
        let roster = vec![claimed, entry("s2", "   ")];
        assert!(find_roster_match(&roster, "alex doe").is_none());
    }

    #[tokio::test]
    async fn test_file_binds_to_named_student() {
        let (store, matcher) = setup(
            vec![entry("s1", "Sam Roe"), entry("s2", "Alex Doe")],
            &[("a.txt", "some text containing the name alex doe here")],
        )
        .await;

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.bound.len(), 1);
        assert_eq!(report.bound[0].student_id, "s2");
        assert!(report.outsiders.is_empty());
        assert!(store.outsiders("j1").await.unwrap().is_empty());

        let rows = store.result_rows("j1").await.unwrap();
        let bound: Vec<_> = rows.iter().filter(|r| r.file.is_some()).collect();
        assert_eq!(bound.len(), 2);
        assert!(bound.iter().all(|r| r.entity_id == "s2"));

        let roster = store.roster("j1").await.unwrap();
        assert!(roster[1].joined);
        assert!(!roster[0].joined);
        assert_eq!(store.job("j1").await.unwrap().status, JobStatus::Matching);
    }

    #[tokio::test]
    async fn test_unmatched_file_creates_one_outsider() {
        let (store, matcher) =
            setup(vec![entry("s1", "Alex Doe")], &[("x.txt", "anonymous answers")]).await;

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.outsiders.len(), 1);
        let outsider = &report.outsiders[0].outsider;
        assert!(outsider.id.starts_with("outsider::"));
        assert_eq!(outsider.name, "Outsider 1");
        assert_eq!(outsider.origin_job_id, "j1");

        let rows: Vec<_> = store
            .result_rows("j1")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.entity_id == outsider.id)
            .collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.file.as_ref().map(|f| f.path.as_str()) == Some("x.txt")));
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let (store, matcher) = setup(
            vec![entry("s1", "Alex Doe")],
            &[("one.txt", "Alex Doe"), ("two.txt", "alex doe again")],
        )
        .await;

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.bound.len(), 1);
        assert_eq!(report.bound[0].file.path, "one.txt");
        assert_eq!(report.outsiders.len(), 1);
        assert_eq!(report.outsiders[0].file.path, "two.txt");
        assert_eq!(store.outsiders("j1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_one_bad_file_does_not_stop_the_batch() {
        let (store, matcher) = setup(
            vec![entry("s1", "Alex Doe")],
            &[("good.txt", "alex doe"), ("other.txt", "who knows")],
        )
        .await;
        store
            .attach_file(
                "j1",
                UploadedFile {
                    path: "scan.pdf".to_string(),
                    content_type: "application/pdf".to_string(),
                },
            )
            .await
            .unwrap();
        store.insert_blob("scan.pdf", b"%PDF".to_vec()).await;

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.bound.len(), 1);
        assert_eq!(report.outsiders.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file.path, "scan.pdf");
        assert_eq!(report.files_seen(), 3);
    }

    #[tokio::test]
    async fn test_rerun_skips_bound_files() {
        let (store, matcher) = setup(
            vec![entry("s1", "Alex Doe")],
            &[("a.txt", "alex doe"), ("b.txt", "nobody")],
        )
        .await;

        matcher.match_files("j1").await.unwrap();
        let second = matcher.match_files("j1").await.unwrap();

        assert!(second.bound.is_empty());
        assert!(second.outsiders.is_empty());
        assert_eq!(second.skipped.len(), 2);
        assert_eq!(store.outsiders("j1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_roster_is_bootstrapped_from_class() {
        let snapshot = Snapshot {
            students: vec![Student {
                id: "s9".to_string(),
                name: "Kim Lee".to_string(),
                class_id: "c1".to_string(),
            }],
            jobs: vec![job(&["q1"])],
            uploads: [("j1".to_string(), vec![text_file("k.txt")])]
                .into_iter()
                .collect(),
            ..Snapshot::default()
        };
        let store = Arc::new(MemoryStore::new(snapshot));
        store.insert_blob("k.txt", b"Kim Lee - answers".to_vec()).await;
        let matcher = DocumentMatcher::new(
            store.clone(),
            Arc::new(PlainTextExtractor),
            MatcherConfig::default(),
        );

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.bound[0].student_id, "s9");
        assert_eq!(store.roster("j1").await.unwrap().len(), 1);
        assert_eq!(store.result_rows("j1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (_, matcher) = setup(vec![], &[]).await;
        let err = matcher.match_files("missing").await.unwrap_err();
        assert!(matches!(err, GradingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_outsider_without_questions_is_a_failure() {
        let snapshot = Snapshot {
            jobs: vec![job(&[])],
            uploads: [("j1".to_string(), vec![text_file("x.txt")])]
                .into_iter()
                .collect(),
            ..Snapshot::default()
        };
        let store = Arc::new(MemoryStore::new(snapshot));
        store.insert_blob("x.txt", b"anonymous".to_vec()).await;
        let matcher = DocumentMatcher::new(
            store.clone(),
            Arc::new(PlainTextExtractor),
            MatcherConfig::default(),
        );

        let report = matcher.match_files("j1").await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(store.outsiders("j1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_runs_bind_each_file_once() {
        let (store, matcher) = setup(
            vec![entry("s1", "Alex Doe")],
            &[("a.txt", "Alex Doe"), ("x.txt", "anonymous answers")],
        )
        .await;

        let (first, second) = tokio::join!(matcher.match_files("j1"), matcher.match_files("j1"));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.bound.len() + second.bound.len(), 1);
        assert_eq!(first.outsiders.len() + second.outsiders.len(), 1);
        assert_eq!(first.skipped.len() + second.skipped.len(), 2);

        let outsiders = store.outsiders("j1").await.unwrap();
        assert_eq!(outsiders.len(), 1);
        assert_eq!(outsiders[0].name, "Outsider 1");

        let rows = store.result_rows("j1").await.unwrap();
        let holders: HashSet<&str> = rows
            .iter()
            .filter(|r| r.file.as_ref().map(|f| f.path.as_str()) == Some("a.txt"))
            .map(|r| r.entity_id.as_str())
            .collect();
        assert_eq!(holders, HashSet::from(["s1"]));
    }

    /// Delegates to a [`MemoryStore`] but can refuse roster binds.
    struct RefusingBinds {
        inner: Arc<MemoryStore>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl Storage for RefusingBinds {
        async fn job(&self, job_id: &str) -> GradingResult<Job> {
            self.inner.job(job_id).await
        }

        async fn jobs(&self) -> GradingResult<Vec<Job>> {
            self.inner.jobs().await
        }

        async fn update_job_status(&self, job_id: &str, status: JobStatus) -> GradingResult<()> {
            self.inner.update_job_status(job_id, status).await
        }

        async fn class_names(&self) -> GradingResult<HashMap<String, String>> {
            self.inner.class_names().await
        }

        async fn students_by_class(&self, class_id: &str) -> GradingResult<Vec<Student>> {
            self.inner.students_by_class(class_id).await
        }

        async fn roster(&self, job_id: &str) -> GradingResult<Vec<RosterEntry>> {
            self.inner.roster(job_id).await
        }

        async fn save_roster(&self, job_id: &str, roster: Vec<RosterEntry>) -> GradingResult<()> {
            self.inner.save_roster(job_id, roster).await
        }

        async fn bind_roster_entry(
            &self,
            job_id: &str,
            student_id: &str,
            file: &UploadedFile,
            rows: Vec<ResultRow>,
        ) -> GradingResult<bool> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(GradingError::Storage("disk full".to_string()));
            }
            self.inner.bind_roster_entry(job_id, student_id, file, rows).await
        }

        async fn uploaded_files(&self, job_id: &str) -> GradingResult<Vec<UploadedFile>> {
            self.inner.uploaded_files(job_id).await
        }

        async fn attach_file(&self, job_id: &str, file: UploadedFile) -> GradingResult<()> {
            self.inner.attach_file(job_id, file).await
        }

        async fn read_file(&self, file: &UploadedFile) -> GradingResult<Vec<u8>> {
            self.inner.read_file(file).await
        }

        async fn outsiders(&self, job_id: &str) -> GradingResult<Vec<OutsiderRecord>> {
            self.inner.outsiders(job_id).await
        }

        async fn add_outsider(
            &self,
            outsider: OutsiderRecord,
            rows: Vec<ResultRow>,
        ) -> GradingResult<()> {
            self.inner.add_outsider(outsider, rows).await
        }

        async fn result_rows(&self, job_id: &str) -> GradingResult<Vec<ResultRow>> {
            self.inner.result_rows(job_id).await
        }

        async fn upsert_result_row(&self, row: ResultRow) -> GradingResult<()> {
            self.inner.upsert_result_row(row).await
        }

        async fn upsert_ai_result(&self, row: ResultRow) -> GradingResult<bool> {
            self.inner.upsert_ai_result(row).await
        }
    }

    #[tokio::test]
    async fn test_failed_bind_is_retried_on_next_run() {
        let (store, _) = setup(vec![entry("s1", "Alex Doe")], &[("a.txt", "alex doe")]).await;
        let storage = Arc::new(RefusingBinds {
            inner: store.clone(),
            refuse: AtomicBool::new(true),
        });
        let matcher = DocumentMatcher::new(
            storage.clone(),
            Arc::new(PlainTextExtractor),
            MatcherConfig::default(),
        );

        let report = matcher.match_files("j1").await.unwrap();
        assert!(report.bound.is_empty());
        assert!(report.outsiders.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(store.roster("j1").await.unwrap()[0].matched_file_ref.is_none());
        assert!(store
            .result_rows("j1")
            .await
            .unwrap()
            .iter()
            .all(|r| r.file.is_none()));

        storage.refuse.store(false, Ordering::SeqCst);
        let report = matcher.match_files("j1").await.unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(report.bound.len(), 1);
        assert_eq!(report.bound[0].student_id, "s1");
    }
}
