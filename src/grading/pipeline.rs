//! Grading pipeline.
//!
//! For every entity of a job with a bound answer document: extract the
//! text, ask the AI grader several independent times, reconcile the passes
//! per question with the [`ConsensusFinalizer`] and persist the outcome.

use crate::analysis::normalize_config;
use crate::consensus::{accepts_ai_update, ConsensusFinalizer};
use crate::error::GradingResult;
use crate::extract::TextExtractor;
use crate::grading::client::AiGrader;
use crate::grading::prompt::{build_grading_prompt, parse_grading_response, samples_for_questions};
use crate::models::{
    EntityGrading, GradeSample, GradingReport, JobStatus, ResultRow, ResultStatus,
    SectionedConfig, UploadedFile,
};
use crate::storage::Storage;
use futures::stream::{self, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of independent AI passes per document.
pub const DEFAULT_PASSES: usize = 3;

/// Default number of jobs graded at the same time.
pub const DEFAULT_JOB_CONCURRENCY: usize = 4;

/// Samples of one pass, keyed by question id.
type PassSamples = HashMap<String, GradeSample>;

/// Runs AI grading passes and stores the reconciled results.
pub struct GradingPipeline {
    storage: Arc<dyn Storage>,
    extractor: Arc<dyn TextExtractor>,
    grader: Arc<dyn AiGrader>,
    finalizer: ConsensusFinalizer,
    passes: usize,
    job_concurrency: usize,
    progress: Option<MultiProgress>,
}

impl GradingPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<dyn TextExtractor>,
        grader: Arc<dyn AiGrader>,
        finalizer: ConsensusFinalizer,
    ) -> Self {
        Self {
            storage,
            extractor,
            grader,
            finalizer,
            passes: DEFAULT_PASSES,
            job_concurrency: DEFAULT_JOB_CONCURRENCY,
            progress: None,
        }
    }

    /// Number of grader calls per document. At least one.
    pub fn with_passes(mut self, passes: usize) -> Self {
        self.passes = passes.max(1);
        self
    }

    /// Jobs graded at the same time by [`grade_jobs`](Self::grade_jobs). At least one.
    pub fn with_job_concurrency(mut self, jobs: usize) -> Self {
        self.job_concurrency = jobs.max(1);
        self
    }

    /// Show a progress bar per job on the terminal.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.progress = show.then(MultiProgress::new);
        self
    }

    fn progress_bar(&self, job_id: &str, len: usize) -> ProgressBar {
        let Some(ref multi) = self.progress else {
            return ProgressBar::hidden();
        };

        let pb = multi.add(ProgressBar::new(len as u64));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_prefix(job_id.to_string());
        pb
    }

    /// Grade every bound, not teacher-locked entity of `job_id`.
    ///
    /// Failures of a single entity (unreadable document, grader errors,
    /// malformed answers) are recorded on that entity and turn its
    /// questions into pending review. Storage errors abort the run.
    pub async fn grade_job(&self, job_id: &str) -> GradingResult<GradingReport> {
        let job = self.storage.job(job_id).await?;
        let config = normalize_config(&job.config);
        let rows = self.storage.result_rows(job_id).await?;

        self.storage
            .update_job_status(job_id, JobStatus::Grading)
            .await?;

        let mut by_entity: BTreeMap<String, Vec<ResultRow>> = BTreeMap::new();
        for row in rows {
            by_entity.entry(row.entity_id.clone()).or_default().push(row);
        }

        let mut report = GradingReport::new(job_id);
        let mut work = Vec::new();

        for (entity_id, rows) in by_entity {
            if rows.iter().all(|r| !accepts_ai_update(r.status)) {
                debug!("Skipping {}: every question is teacher graded", entity_id);
                report.entities.push(EntityGrading {
                    entity_id,
                    teacher_locked: rows.len(),
                    ..EntityGrading::default()
                });
                continue;
            }

            match rows.iter().find_map(|r| r.file.clone()) {
                Some(file) => work.push((entity_id, file, rows)),
                None => report.unbound_entities += 1,
            }
        }

        info!(
            "Job {}: grading {} entities with {} passes each ({} without a document)",
            job_id,
            work.len(),
            self.passes,
            report.unbound_entities
        );

        let pb = self.progress_bar(job_id, work.len());
        for (entity_id, file, rows) in work {
            pb.set_message(entity_id.clone());
            let grading = self
                .grade_entity(job_id, &config, &entity_id, &file, rows)
                .await?;
            pb.inc(1);
            report.entities.push(grading);
        }
        pb.finish_and_clear();

        let rows = self.storage.result_rows(job_id).await?;
        let open = rows
            .iter()
            .filter(|r| matches!(r.status, ResultStatus::Pending | ResultStatus::PendingReview))
            .count();
        if !rows.is_empty() && open == 0 {
            self.storage
                .update_job_status(job_id, JobStatus::Completed)
                .await?;
            info!("Job {} completed", job_id);
        } else {
            info!("Job {}: {} questions still need attention", job_id, open);
        }

        Ok(report)
    }

    /// Grade several jobs concurrently. One result per job, in input order.
    pub async fn grade_jobs(&self, job_ids: &[String]) -> Vec<GradingResult<GradingReport>> {
        stream::iter(job_ids)
            .map(|id| self.grade_job(id))
            .buffered(self.job_concurrency)
            .collect()
            .await
    }

    async fn grade_entity(
        &self,
        job_id: &str,
        config: &SectionedConfig,
        entity_id: &str,
        file: &UploadedFile,
        rows: Vec<ResultRow>,
    ) -> GradingResult<EntityGrading> {
        let mut grading = EntityGrading {
            entity_id: entity_id.to_string(),
            ..EntityGrading::default()
        };

        let passes = match self.extract_text(file).await {
            Ok(text) => self.run_passes(config, &text, &mut grading.errors).await,
            Err(e) => {
                warn!("Cannot read answers of {} from {}: {}", entity_id, file.path, e);
                grading.errors.push(format!("{}: {}", file.path, e));
                Vec::new()
            }
        };

        for question in config.questions() {
            let mut row = rows
                .iter()
                .find(|r| r.question_id == question.id)
                .cloned()
                .unwrap_or_else(|| {
                    let mut row = ResultRow::pending(job_id, entity_id, &question.id);
                    row.file = Some(file.clone());
                    row
                });

            if !accepts_ai_update(row.status) {
                grading.teacher_locked += 1;
                continue;
            }

            let samples: Vec<GradeSample> = passes
                .iter()
                .filter_map(|pass| pass.get(&question.id).cloned())
                .collect();
            let result = self.finalizer.finalize(&samples, &question.max_score);
            let agreed = result.status == ResultStatus::AiGraded;

            row.apply(result);
            // A teacher may have graded the question while the passes ran.
            if !self.storage.upsert_ai_result(row).await? {
                grading.teacher_locked += 1;
            } else if agreed {
                grading.ai_graded += 1;
            } else {
                grading.pending_review += 1;
            }
        }

        debug!(
            "{}: {} AI graded, {} pending review, {} teacher graded",
            entity_id, grading.ai_graded, grading.pending_review, grading.teacher_locked
        );
        Ok(grading)
    }

    async fn extract_text(&self, file: &UploadedFile) -> GradingResult<String> {
        let bytes = self.storage.read_file(file).await?;
        self.extractor.extract(&bytes, &file.content_type).await
    }

    /// Independent grader calls over the same prompt. A failed pass still
    /// yields samples, all of them missing.
    async fn run_passes(
        &self,
        config: &SectionedConfig,
        text: &str,
        errors: &mut Vec<String>,
    ) -> Vec<PassSamples> {
        let prompt = build_grading_prompt(config, text);
        let mut passes = Vec::with_capacity(self.passes);

        for pass in 1..=self.passes {
            let parsed = self
                .grader
                .grade(&prompt)
                .await
                .and_then(|raw| parse_grading_response(&raw));

            if let Err(ref e) = parsed {
                warn!("Grading pass {}/{} failed: {}", pass, self.passes, e);
                errors.push(format!("pass {}: {}", pass, e));
            }

            passes.push(samples_for_questions(parsed, config.questions()).into_iter().collect());
        }

        passes
    }
}
