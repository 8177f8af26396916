//! Markdown report generation.
//!
//! This module renders a [`RunReport`] as a Markdown document for
//! reviewers, or as pretty-printed JSON.

use crate::models::{
    Analytics, EntityKind, EntityResults, GradingReport, JobRun, MatchReport, Question,
    ReportMetadata, ResultCell, ResultStatus, RunReport,
};
use anyhow::Result;
use bigdecimal::BigDecimal;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# GradeConsensus Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.jobs));

    for job in &report.jobs {
        output.push_str(&generate_job_section(job));
    }

    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Store:** `{}`\n", metadata.store));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    section.push_str(&format!("- **Passes per Document:** {}\n", metadata.passes));
    section.push_str(&format!("- **Agreement Band:** {}\n", metadata.tolerance));
    section.push_str(&format!(
        "- **Run Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the summary table across jobs.
fn generate_summary_section(jobs: &[JobRun]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    if jobs.is_empty() {
        section.push_str("No jobs were processed.\n\n");
        return section;
    }

    section.push_str(&format!(
        "| Job | Class | Status | Processed | {} Pending review | Class average |\n",
        ResultStatus::PendingReview.emoji()
    ));
    section.push_str("|:---|:---|:---:|:---:|:---:|:---:|\n");

    for job in jobs {
        let summary = &job.overview.summary;
        section.push_str(&format!(
            "| {} | {} | {} | {}/{} | {} | {} |\n",
            summary.name,
            summary.class_name,
            summary.status,
            summary.progress.processed,
            summary.progress.total,
            job.review_count(),
            format_percentage(job.overview.analytics.class_average.as_ref()),
        ));
    }
    section.push('\n');

    section
}

/// Generate everything reported for one job.
fn generate_job_section(job: &JobRun) -> String {
    let mut section = String::new();
    let summary = &job.overview.summary;

    section.push_str(&format!("## {} (`{}`)\n\n", summary.name, summary.id));
    section.push_str(&format!(
        "*Class: {} | Status: {} | Entities: {}*\n\n",
        summary.class_name,
        summary.status,
        job.overview.entities.len()
    ));

    section.push_str(&generate_analytics_section(
        &job.overview.analytics,
        &job.overview.questions,
    ));
    section.push_str(&generate_results_section(
        &job.overview.entities,
        &job.overview.questions,
    ));

    if let Some(ref matching) = job.matching {
        section.push_str(&generate_matching_section(matching));
    }
    if let Some(ref grading) = job.grading {
        section.push_str(&generate_grading_section(grading));
    }

    section.push_str("---\n\n");
    section
}

/// Generate the analytics section.
fn generate_analytics_section(analytics: &Analytics, questions: &[Question]) -> String {
    let mut section = String::new();

    section.push_str("### Analytics\n\n");
    section.push_str(&format!(
        "**Class average:** {} over {} graded entities\n\n",
        format_percentage(analytics.class_average.as_ref()),
        analytics.graded_entities
    ));

    if questions.is_empty() {
        return section;
    }

    section.push_str("| Question | Max score | Average |\n");
    section.push_str("|:---|:---:|:---:|\n");
    for question in questions {
        let average = analytics
            .performance_by_question
            .get(&question.id)
            .and_then(Option::as_ref);
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            question.id,
            question.max_score,
            format_percentage(average)
        ));
    }
    section.push('\n');

    section
}

/// Generate the per-entity result table.
fn generate_results_section(entities: &[EntityResults], questions: &[Question]) -> String {
    let mut section = String::new();

    section.push_str("### Results\n\n");

    if entities.is_empty() {
        section.push_str("No students on the roster and no outsiders.\n\n");
        return section;
    }

    section.push_str("| Student |");
    for question in questions {
        section.push_str(&format!(" {} |", question.id));
    }
    section.push_str(" Total |\n|:---|");
    for _ in questions {
        section.push_str(":---:|");
    }
    section.push_str(":---:|\n");

    for entity in entities {
        let name = match entity.entity.kind {
            EntityKind::Roster => entity.entity.name.clone(),
            EntityKind::Outsider => format!("*{}*", entity.entity.name),
        };
        section.push_str(&format!("| {} |", name));
        for (_, cell) in &entity.cells {
            section.push_str(&format!(" {} |", format_cell(cell)));
        }
        section.push_str(&format!(
            " **{}** / {} |\n",
            entity.total, entity.max_total
        ));
    }
    section.push('\n');

    section.push_str(&format!(
        "{} AI graded | {} Pending review | {} Teacher graded | {} Not graded\n\n",
        ResultStatus::AiGraded.emoji(),
        ResultStatus::PendingReview.emoji(),
        ResultStatus::TeacherGraded.emoji(),
        ResultStatus::Pending.emoji(),
    ));

    section
}

/// Generate the document matching section.
fn generate_matching_section(matching: &MatchReport) -> String {
    let mut section = String::new();

    section.push_str("### Document Matching\n\n");
    section.push_str(&format!(
        "- **Files seen:** {}\n- **Bound to roster:** {}\n- **New outsiders:** {}\n- **Already bound:** {}\n",
        matching.files_seen(),
        matching.bound.len(),
        matching.outsiders.len(),
        matching.skipped.len()
    ));
    section.push('\n');

    for outsider in &matching.outsiders {
        section.push_str(&format!(
            "- `{}` → {}\n",
            outsider.file.path, outsider.outsider.name
        ));
    }
    if !matching.outsiders.is_empty() {
        section.push('\n');
    }

    if !matching.failures.is_empty() {
        section.push_str("**Failed files:**\n\n");
        for failure in &matching.failures {
            section.push_str(&format!("- `{}`: {}\n", failure.file.path, failure.error));
        }
        section.push('\n');
    }

    section
}

/// Generate the AI grading section.
fn generate_grading_section(grading: &GradingReport) -> String {
    let mut section = String::new();

    section.push_str("### AI Grading\n\n");
    section.push_str(&format!(
        "- **Entities graded:** {}\n- **Questions AI graded:** {}\n- **Questions pending review:** {}\n- **Entities without a document:** {}\n\n",
        grading.entities.len(),
        grading.ai_graded(),
        grading.pending_review(),
        grading.unbound_entities
    ));

    let with_errors: Vec<_> = grading
        .entities
        .iter()
        .filter(|e| !e.errors.is_empty())
        .collect();
    if !with_errors.is_empty() {
        section.push_str("**Problems:**\n\n");
        for entity in with_errors {
            for error in &entity.errors {
                section.push_str(&format!("- `{}`: {}\n", entity.entity_id, error));
            }
        }
        section.push('\n');
    }

    section
}

fn format_cell(cell: &ResultCell) -> String {
    match cell.grade {
        Some(ref grade) => format!("{} {}", grade, cell.status.emoji()),
        None => format!("- {}", cell.status.emoji()),
    }
}

fn format_percentage(value: Option<&BigDecimal>) -> String {
    match value {
        Some(v) => format!("{}%", v),
        None => "n/a".to_string(),
    }
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("*Report generated by GradeConsensus*\n");

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Entity, EntityGrading, FileFailure, JobStatus, JobSummary, OutsiderFile, OutsiderRecord,
        Overview, Progress, UploadedFile,
    };
    use chrono::Utc;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            generated_at: Utc::now(),
            store: "school.json".to_string(),
            model_used: "test-model".to_string(),
            passes: 3,
            tolerance: "1.5% of max score".to_string(),
            duration_seconds: 12.0,
        }
    }

    fn cell(grade: Option<&str>, status: ResultStatus) -> ResultCell {
        ResultCell {
            grade: grade.map(dec),
            status,
            feedback: None,
        }
    }

    fn file(path: &str) -> UploadedFile {
        UploadedFile {
            path: path.to_string(),
            content_type: "text/plain".to_string(),
        }
    }

    fn job_run() -> JobRun {
        let questions = vec![Question {
            id: "q1".to_string(),
            max_score: dec("10"),
            prompt: String::new(),
            rubric: None,
        }];
        JobRun {
            overview: Overview {
                summary: JobSummary {
                    id: "midterm".to_string(),
                    name: "Midterm".to_string(),
                    class_name: "Physics 101".to_string(),
                    status: JobStatus::Grading,
                    progress: Progress {
                        total: 2,
                        processed: 2,
                    },
                },
                questions,
                entities: vec![
                    EntityResults {
                        entity: Entity {
                            id: "s1".to_string(),
                            name: "Alex Doe".to_string(),
                            kind: EntityKind::Roster,
                        },
                        cells: vec![("q1".to_string(), cell(Some("7.05"), ResultStatus::AiGraded))],
                        total: dec("7.05"),
                        max_total: dec("10"),
                    },
                    EntityResults {
                        entity: Entity {
                            id: "outsider::abc".to_string(),
                            name: "Outsider 1".to_string(),
                            kind: EntityKind::Outsider,
                        },
                        cells: vec![("q1".to_string(), cell(None, ResultStatus::PendingReview))],
                        total: dec("0"),
                        max_total: dec("10"),
                    },
                ],
                analytics: Analytics {
                    class_average: Some(dec("70.50")),
                    graded_entities: 1,
                    performance_by_question: [("q1".to_string(), Some(dec("70.50")))]
                        .into_iter()
                        .collect(),
                },
            },
            matching: Some(MatchReport {
                job_id: "midterm".to_string(),
                outsiders: vec![OutsiderFile {
                    file: file("unknown.txt"),
                    outsider: OutsiderRecord {
                        id: "outsider::abc".to_string(),
                        name: "Outsider 1".to_string(),
                        origin_job_id: "midterm".to_string(),
                    },
                }],
                failures: vec![FileFailure {
                    file: file("scan.bin"),
                    error: "unsupported content type".to_string(),
                }],
                ..MatchReport::default()
            }),
            grading: Some(GradingReport {
                job_id: "midterm".to_string(),
                entities: vec![EntityGrading {
                    entity_id: "s1".to_string(),
                    ai_graded: 1,
                    errors: vec!["pass 2: grader error".to_string()],
                    ..EntityGrading::default()
                }],
                unbound_entities: 0,
            }),
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let report = RunReport {
            metadata: metadata(),
            jobs: vec![job_run()],
        };
        let markdown = generate_markdown_report(&report);

        assert!(markdown.contains("# GradeConsensus Report"));
        assert!(markdown.contains("## Metadata"));
        assert!(markdown.contains("## Summary"));
        assert!(markdown.contains("## Midterm (`midterm`)"));
        assert!(markdown.contains("| Alex Doe | 7.05 🤖 | **7.05** / 10 |"));
        assert!(markdown.contains("*Outsider 1*"));
        assert!(markdown.contains("70.50%"));
        assert!(markdown.contains("`scan.bin`: unsupported content type"));
        assert!(markdown.contains("pass 2: grader error"));
    }

    #[test]
    fn test_review_count() {
        let report = RunReport {
            metadata: metadata(),
            jobs: vec![job_run(), job_run()],
        };
        assert_eq!(report.review_count(), 2);
    }

    #[test]
    fn test_empty_run() {
        let report = RunReport {
            metadata: metadata(),
            jobs: vec![],
        };
        let markdown = generate_markdown_report(&report);
        assert!(markdown.contains("No jobs were processed."));
    }

    #[test]
    fn test_generate_metadata_section() {
        let section = generate_metadata_section(&metadata());
        assert!(section.contains("school.json"));
        assert!(section.contains("test-model"));
        assert!(section.contains("1.5% of max score"));
    }

    #[test]
    fn test_generate_json_report() {
        let report = RunReport {
            metadata: metadata(),
            jobs: vec![job_run()],
        };
        let json = generate_json_report(&report).unwrap();

        assert!(json.contains("\"metadata\""));
        assert!(json.contains("\"overview\""));
        assert!(json.contains("\"pending_review\""));
    }
}
