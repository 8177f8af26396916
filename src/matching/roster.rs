//! Roster bootstrap and job initialisation.

use crate::analysis::normalize_config;
use crate::error::GradingResult;
use crate::models::{Job, ResultRow, RosterEntry};
use crate::storage::Storage;
use std::collections::HashSet;
use tracing::{debug, info};

/// Return the job's roster, taking a snapshot of the class roster first if
/// the job does not have one yet.
pub async fn ensure_roster(storage: &dyn Storage, job: &Job) -> GradingResult<Vec<RosterEntry>> {
    let roster = storage.roster(&job.id).await?;
    if !roster.is_empty() {
        return Ok(roster);
    }

    let students = storage.students_by_class(&job.class_id).await?;
    let roster: Vec<RosterEntry> = students.iter().map(RosterEntry::from).collect();
    info!(
        "Job {}: took roster snapshot of {} students from class {}",
        job.id,
        roster.len(),
        job.class_id
    );
    storage.save_roster(&job.id, roster.clone()).await?;
    Ok(roster)
}

/// Create pending placeholder rows for every roster student and question.
///
/// Existing rows are left untouched, so running this twice is harmless.
/// Returns the number of rows created.
pub async fn initialize_job(storage: &dyn Storage, job_id: &str) -> GradingResult<usize> {
    let job = storage.job(job_id).await?;
    let roster = ensure_roster(storage, &job).await?;
    let config = normalize_config(&job.config);

    let existing: HashSet<(String, String)> = storage
        .result_rows(job_id)
        .await?
        .into_iter()
        .map(|r| (r.entity_id, r.question_id))
        .collect();

    let mut created = 0;
    for entry in &roster {
        for question in config.questions() {
            if existing.contains(&(entry.student_id.clone(), question.id.clone())) {
                continue;
            }
            storage
                .upsert_result_row(ResultRow::pending(job_id, &entry.student_id, &question.id))
                .await?;
            created += 1;
        }
    }

    debug!("Job {}: created {} placeholder rows", job_id, created);
    Ok(created)
}
