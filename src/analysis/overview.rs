//! Reviewer-facing operations over persisted results.

use crate::analysis::aggregator::{
    build_job_summaries, build_result_matrix, compute_analytics, entity_results,
    normalize_config, sum_grades,
};
use crate::consensus::ConsensusFinalizer;
use crate::error::{GradingError, GradingResult};
use crate::models::{Entity, JobSummary, Overview, Question, ResultRow};
use crate::storage::Storage;
use bigdecimal::{BigDecimal, Zero};
use std::sync::Arc;
use tracing::{debug, info};

/// Builds overviews and applies teacher edits against a [`Storage`].
#[derive(Clone)]
pub struct ResultsService {
    storage: Arc<dyn Storage>,
}

impl ResultsService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Roster students followed by this job's outsiders.
    async fn entities(&self, job_id: &str) -> GradingResult<Vec<Entity>> {
        let roster = self.storage.roster(job_id).await?;
        let outsiders = self.storage.outsiders(job_id).await?;

        Ok(roster
            .iter()
            .map(Entity::from)
            .chain(outsiders.iter().map(Entity::from))
            .collect())
    }

    /// Summary, dense per-entity results and analytics for one job.
    pub async fn build_overview(&self, job_id: &str) -> GradingResult<Overview> {
        let job = self.storage.job(job_id).await?;
        let questions: Vec<Question> = normalize_config(&job.config).questions().cloned().collect();
        let entities = self.entities(job_id).await?;
        let rows = self.storage.result_rows(job_id).await?;
        let class_names = self.storage.class_names().await?;

        let matrix = build_result_matrix(&entities, &questions, &rows);
        debug!(
            "Job {}: {} entities x {} questions = {} cells",
            job_id,
            matrix.entities().len(),
            questions.len(),
            matrix.len()
        );

        let summary = build_job_summaries(std::slice::from_ref(&job), &rows, &class_names)
            .pop()
            .ok_or_else(|| GradingError::not_found("job summary", job_id))?;

        Ok(Overview {
            summary,
            analytics: compute_analytics(&matrix, &questions),
            entities: entity_results(&matrix, &questions),
            questions,
        })
    }

    /// Progress summaries for every job in storage.
    pub async fn job_summaries(&self) -> GradingResult<Vec<JobSummary>> {
        let jobs = self.storage.jobs().await?;
        let class_names = self.storage.class_names().await?;

        let mut rows = Vec::new();
        for job in &jobs {
            rows.extend(self.storage.result_rows(&job.id).await?);
        }

        Ok(build_job_summaries(&jobs, &rows, &class_names))
    }

    /// Set a teacher grade on one cell and return the entity's new total.
    ///
    /// The cell becomes teacher-graded and later AI passes leave it alone.
    pub async fn apply_teacher_edit(
        &self,
        job_id: &str,
        entity_id: &str,
        question_id: &str,
        grade: BigDecimal,
        feedback: Option<String>,
    ) -> GradingResult<BigDecimal> {
        let job = self.storage.job(job_id).await?;
        let config = normalize_config(&job.config);

        let question = config
            .question(question_id)
            .ok_or_else(|| GradingError::not_found("question", question_id))?;

        if !self
            .entities(job_id)
            .await?
            .iter()
            .any(|e| e.id == entity_id)
        {
            return Err(GradingError::not_found("entity", entity_id));
        }

        if grade < BigDecimal::zero() || grade > question.max_score {
            return Err(GradingError::InvalidGrade {
                question_id: question_id.to_string(),
                grade,
                max_score: question.max_score.clone(),
            });
        }

        let rows = self.storage.result_rows(job_id).await?;
        let mut row = rows
            .iter()
            .find(|r| r.entity_id == entity_id && r.question_id == question_id)
            .cloned()
            .unwrap_or_else(|| ResultRow::pending(job_id, entity_id, question_id));

        row.apply(ConsensusFinalizer::apply_override(grade, feedback));
        self.storage.upsert_result_row(row).await?;

        let rows = self.storage.result_rows(job_id).await?;
        let total = sum_grades(
            rows.iter()
                .filter(|r| r.entity_id == entity_id && config.question(&r.question_id).is_some())
                .map(|r| r.grade.as_ref()),
        );

        info!(
            "Teacher edit on {}/{} in job {}, new total {}",
            entity_id, question_id, job_id, total
        );
        Ok(total)
    }
}
