//! Result aggregation and statistics.
//!
//! This module normalizes assessment configurations, builds the dense
//! entity × question result matrix, and computes job progress and
//! class/question analytics from persisted result rows.

use crate::models::{
    Analytics, AssessmentConfig, Entity, EntityResults, Job, JobSummary, Progress, Question,
    ResultCell, ResultRow, Section, SectionedConfig,
};
use bigdecimal::{BigDecimal, Zero};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Decimal places kept in reported percentages.
const PERCENT_SCALE: i64 = 2;

/// Class name shown when a job's class is not known to storage.
const UNKNOWN_CLASS: &str = "Unknown class";

/// Normalize a persisted configuration into the sectioned shape.
///
/// A flat question list becomes one untitled section holding every question.
/// A question id repeated anywhere later in the config is dropped; the first
/// occurrence wins.
pub fn normalize_config(config: &AssessmentConfig) -> SectionedConfig {
    let mut sectioned = match config {
        AssessmentConfig::Sectioned(sectioned) => sectioned.clone(),
        AssessmentConfig::Flat(questions) => SectionedConfig {
            sections: vec![Section {
                title: String::new(),
                questions: questions.clone(),
            }],
        },
    };

    let mut seen = HashSet::new();
    for section in &mut sectioned.sections {
        section.questions.retain(|q| seen.insert(q.id.clone()));
    }
    sectioned
}

/// Dense entity × question grid of result cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMatrix {
    entities: Vec<Entity>,
    question_ids: Vec<String>,
    cells: BTreeMap<String, BTreeMap<String, ResultCell>>,
}

impl ResultMatrix {
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn question_ids(&self) -> &[String] {
        &self.question_ids
    }

    pub fn cell(&self, entity_id: &str, question_id: &str) -> Option<&ResultCell> {
        self.cells.get(entity_id)?.get(question_id)
    }

    /// Cells of one entity in question order.
    pub fn row<'a>(&'a self, entity_id: &'a str) -> impl Iterator<Item = (&'a str, &'a ResultCell)> {
        self.question_ids
            .iter()
            .filter_map(move |q| self.cell(entity_id, q).map(|cell| (q.as_str(), cell)))
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.cells.values().map(|row| row.len()).sum()
    }
}

/// Questions in order, each id only at its first occurrence.
fn distinct(questions: &[Question]) -> Vec<&Question> {
    let mut seen = HashSet::new();
    questions.iter().filter(|q| seen.insert(q.id.as_str())).collect()
}

/// Build the dense result matrix.
///
/// Every `(entity, question)` pair gets a cell. Pairs without a persisted
/// row default to an ungraded pending cell; rows for unknown entities or
/// questions are ignored. Duplicate entity or question ids keep their first
/// occurrence.
pub fn build_result_matrix(
    entities: &[Entity],
    questions: &[Question],
    rows: &[ResultRow],
) -> ResultMatrix {
    let mut seen = HashSet::new();
    let entities: Vec<Entity> = entities
        .iter()
        .filter(|e| seen.insert(e.id.clone()))
        .cloned()
        .collect();
    let question_ids: Vec<String> = distinct(questions)
        .into_iter()
        .map(|q| q.id.clone())
        .collect();

    let mut cells: BTreeMap<String, BTreeMap<String, ResultCell>> = entities
        .iter()
        .map(|e| {
            let row = question_ids
                .iter()
                .map(|q| (q.clone(), ResultCell::default()))
                .collect();
            (e.id.clone(), row)
        })
        .collect();

    for row in rows {
        if let Some(cell) = cells
            .get_mut(&row.entity_id)
            .and_then(|entity_cells| entity_cells.get_mut(&row.question_id))
        {
            *cell = row.cell();
        }
    }

    ResultMatrix {
        entities,
        question_ids,
        cells,
    }
}

/// Build progress summaries for `jobs`, in the order given.
///
/// `total` counts distinct entities with at least one row in the job;
/// `processed` counts those none of whose rows is still pending.
pub fn build_job_summaries(
    jobs: &[Job],
    rows: &[ResultRow],
    class_names: &HashMap<String, String>,
) -> Vec<JobSummary> {
    // job id -> entity id -> every row processed so far
    let mut by_job: HashMap<&str, BTreeMap<&str, bool>> = HashMap::new();
    for row in rows {
        let processed = by_job
            .entry(row.job_id.as_str())
            .or_default()
            .entry(row.entity_id.as_str())
            .or_insert(true);
        *processed &= !row.status.is_pending();
    }

    jobs.iter()
        .map(|job| {
            let entities = by_job.get(job.id.as_str());
            let progress = Progress {
                total: entities.map_or(0, |e| e.len()),
                processed: entities.map_or(0, |e| e.values().filter(|done| **done).count()),
            };

            JobSummary {
                id: job.id.clone(),
                name: job.name.clone(),
                class_name: class_names
                    .get(&job.class_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_CLASS.to_string()),
                status: job.status,
                progress,
            }
        })
        .collect()
}

/// Express `grade` as a percentage of `max_score`. `None` for a zero max.
pub fn percentage(grade: &BigDecimal, max_score: &BigDecimal) -> Option<BigDecimal> {
    if max_score.is_zero() {
        return None;
    }
    Some(grade * &BigDecimal::from(100) / max_score.clone())
}

fn mean(values: &[BigDecimal]) -> Option<BigDecimal> {
    if values.is_empty() {
        return None;
    }
    let sum = values.iter().fold(BigDecimal::zero(), |acc, v| acc + v);
    Some(sum / BigDecimal::from(values.len() as u64))
}

/// Exact sum of the grades that are present. Absent grades add nothing.
pub fn sum_grades<'a>(grades: impl IntoIterator<Item = Option<&'a BigDecimal>>) -> BigDecimal {
    grades
        .into_iter()
        .flatten()
        .fold(BigDecimal::zero(), |acc, g| acc + g)
}

/// Class average and per-question performance, as percentages.
///
/// Each entity's own average is the mean of its graded questions' percentages;
/// the class average is the mean of those, over entities with at least one
/// graded question. Ungraded cells are never counted as zero.
pub fn compute_analytics(matrix: &ResultMatrix, questions: &[Question]) -> Analytics {
    let max_scores: HashMap<&str, &BigDecimal> = distinct(questions)
        .into_iter()
        .map(|q| (q.id.as_str(), &q.max_score))
        .collect();

    let mut entity_averages = Vec::new();
    let mut by_question: HashMap<&str, Vec<BigDecimal>> = HashMap::new();

    for entity in matrix.entities() {
        let mut percents = Vec::new();
        for (question_id, cell) in matrix.row(&entity.id) {
            let percent = cell.grade.as_ref().and_then(|grade| {
                max_scores
                    .get(question_id)
                    .and_then(|max| percentage(grade, max))
            });
            if let Some(percent) = percent {
                by_question
                    .entry(question_id)
                    .or_default()
                    .push(percent.clone());
                percents.push(percent);
            }
        }
        if let Some(average) = mean(&percents) {
            entity_averages.push(average);
        }
    }

    let performance_by_question = matrix
        .question_ids()
        .iter()
        .map(|q| {
            let average = by_question
                .get(q.as_str())
                .and_then(|values| mean(values))
                .map(|v| v.round(PERCENT_SCALE));
            (q.clone(), average)
        })
        .collect();

    Analytics {
        class_average: mean(&entity_averages).map(|v| v.round(PERCENT_SCALE)),
        graded_entities: entity_averages.len(),
        performance_by_question,
    }
}

/// Per-entity rows of the matrix with their totals, in entity order.
pub fn entity_results(matrix: &ResultMatrix, questions: &[Question]) -> Vec<EntityResults> {
    let max_total = sum_grades(distinct(questions).into_iter().map(|q| Some(&q.max_score)));

    matrix
        .entities()
        .iter()
        .map(|entity| {
            let cells: Vec<(String, ResultCell)> = matrix
                .row(&entity.id)
                .map(|(q, cell)| (q.to_string(), cell.clone()))
                .collect();
            let total = sum_grades(cells.iter().map(|(_, cell)| cell.grade.as_ref()));

            EntityResults {
                entity: entity.clone(),
                cells,
                total,
                max_total: max_total.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, JobStatus, ResultStatus};
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn question(id: &str, max: &str) -> Question {
        Question {
            id: id.to_string(),
            max_score: dec(max),
            prompt: String::new(),
            rubric: None,
        }
    }

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_uppercase(),
            kind: EntityKind::Roster,
        }
    }

    fn graded(job: &str, entity: &str, question: &str, grade: &str) -> ResultRow {
        let mut row = ResultRow::pending(job, entity, question);
        row.grade = Some(dec(grade));
        row.status = ResultStatus::AiGraded;
        row
    }

    fn job(id: &str, class_id: &str) -> Job {
        Job {
            id: id.to_string(),
            name: format!("Job {}", id),
            class_id: class_id.to_string(),
            status: JobStatus::Grading,
            config: AssessmentConfig::Flat(vec![]),
        }
    }

    #[test]
    fn test_normalize_flat_config() {
        let flat = AssessmentConfig::Flat(vec![question("q1", "10"), question("q2", "5")]);
        let sectioned = normalize_config(&flat);
        assert_eq!(sectioned.sections.len(), 1);
        assert_eq!(sectioned.questions().count(), 2);
    }

    #[test]
    fn test_normalize_sectioned_config_is_unchanged() {
        let config = SectionedConfig {
            sections: vec![
                Section {
                    title: "A".to_string(),
                    questions: vec![question("q1", "10")],
                },
                Section {
                    title: "B".to_string(),
                    questions: vec![question("q2", "10")],
                },
            ],
        };
        let normalized = normalize_config(&AssessmentConfig::Sectioned(config.clone()));
        assert_eq!(normalized, config);
    }

    #[test]
    fn test_normalize_drops_repeated_question_ids() {
        let config = AssessmentConfig::Sectioned(SectionedConfig {
            sections: vec![
                Section {
                    title: "A".to_string(),
                    questions: vec![question("q1", "10"), question("q2", "5")],
                },
                Section {
                    title: "B".to_string(),
                    questions: vec![question("q1", "3")],
                },
            ],
        });

        let normalized = normalize_config(&config);
        let ids: Vec<&str> = normalized.questions().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q1", "q2"]);
        assert_eq!(normalized.question("q1").unwrap().max_score, dec("10"));
        assert!(normalized.sections[1].questions.is_empty());
    }

    #[test]
    fn test_repeated_question_is_counted_once() {
        let entities = vec![entity("s1")];
        let questions = vec![question("q1", "10"), question("q1", "10")];
        let rows = vec![graded("j1", "s1", "q1", "4")];

        let matrix = build_result_matrix(&entities, &questions, &rows);
        assert_eq!(matrix.question_ids().to_vec(), vec!["q1".to_string()]);
        assert_eq!(matrix.row("s1").count(), 1);
        assert_eq!(matrix.len(), 1);

        let results = entity_results(&matrix, &questions);
        assert_eq!(results[0].total, dec("4"));
        assert_eq!(results[0].max_total, dec("10"));
    }

    #[test]
    fn test_matrix_is_dense_without_rows() {
        let entities = vec![entity("s1"), entity("s2"), entity("s3")];
        let questions = vec![question("q1", "10"), question("q2", "10")];
        let matrix = build_result_matrix(&entities, &questions, &[]);

        assert_eq!(matrix.len(), 6);
        for e in &entities {
            for q in &questions {
                assert_eq!(matrix.cell(&e.id, &q.id), Some(&ResultCell::default()));
            }
        }
    }

    #[test]
    fn test_matrix_overlays_rows_and_ignores_strangers() {
        let entities = vec![entity("s1")];
        let questions = vec![question("q1", "10"), question("q2", "10")];
        let rows = vec![
            graded("j1", "s1", "q1", "8"),
            graded("j1", "ghost", "q1", "3"),
            graded("j1", "s1", "retired", "3"),
        ];
        let matrix = build_result_matrix(&entities, &questions, &rows);

        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.cell("s1", "q1").unwrap().grade, Some(dec("8")));
        assert_eq!(matrix.cell("s1", "q2").unwrap().status, ResultStatus::Pending);
        assert!(matrix.cell("ghost", "q1").is_none());
    }

    #[test]
    fn test_job_summary_progress() {
        let jobs = vec![job("j1", "c1"), job("j2", "missing")];
        let mut rows = vec![
            graded("j1", "s1", "q1", "8"),
            graded("j1", "s1", "q2", "9"),
            graded("j1", "s2", "q1", "5"),
            ResultRow::pending("j1", "s2", "q2"),
        ];
        let mut review = ResultRow::pending("j1", "s3", "q1");
        review.status = ResultStatus::PendingReview;
        rows.push(review);

        let class_names: HashMap<String, String> =
            [("c1".to_string(), "Grade 10A".to_string())].into_iter().collect();
        let summaries = build_job_summaries(&jobs, &rows, &class_names);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].class_name, "Grade 10A");
        assert_eq!(summaries[0].progress, Progress { total: 3, processed: 2 });
        assert_eq!(summaries[1].class_name, UNKNOWN_CLASS);
        assert_eq!(summaries[1].progress, Progress::default());
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let jobs = vec![job("j1", "c1")];
        let rows = vec![graded("j1", "s1", "q1", "8"), graded("j1", "s2", "q1", "6.5")];
        let names = HashMap::new();

        let first = serde_json::to_string(&build_job_summaries(&jobs, &rows, &names)).unwrap();
        let second = serde_json::to_string(&build_job_summaries(&jobs, &rows, &names)).unwrap();
        assert_eq!(first, second);

        let questions = vec![question("q1", "10")];
        let entities = vec![entity("s1"), entity("s2")];
        let a = build_result_matrix(&entities, &questions, &rows);
        let b = build_result_matrix(&entities, &questions, &rows);
        assert_eq!(
            serde_json::to_string(&compute_analytics(&a, &questions)).unwrap(),
            serde_json::to_string(&compute_analytics(&b, &questions)).unwrap()
        );
    }

    #[test]
    fn test_analytics_excludes_ungraded_entities() {
        let questions = vec![question("q1", "10"), question("q2", "20")];
        let entities = vec![entity("s1"), entity("s2"), entity("s3")];
        let rows = vec![
            // s1: 80% and 50% -> 65%
            graded("j1", "s1", "q1", "8"),
            graded("j1", "s1", "q2", "10"),
            // s2: 100% on the only graded question
            graded("j1", "s2", "q1", "10"),
            // s3: nothing graded
        ];
        let matrix = build_result_matrix(&entities, &questions, &rows);
        let analytics = compute_analytics(&matrix, &questions);

        assert_eq!(analytics.graded_entities, 2);
        assert_eq!(analytics.class_average, Some(dec("82.5")));
        assert_eq!(analytics.performance_by_question["q1"], Some(dec("90")));
        assert_eq!(analytics.performance_by_question["q2"], Some(dec("50")));
    }

    #[test]
    fn test_analytics_without_grades() {
        let questions = vec![question("q1", "10")];
        let matrix = build_result_matrix(&[entity("s1")], &questions, &[]);
        let analytics = compute_analytics(&matrix, &questions);

        assert_eq!(analytics.class_average, None);
        assert_eq!(analytics.performance_by_question["q1"], None);
    }

    #[test]
    fn test_zero_is_a_grade_but_absent_is_not() {
        assert_eq!(sum_grades([Some(&dec("0")), None, Some(&dec("2.25"))]), dec("2.25"));

        let questions = vec![question("q1", "10"), question("q2", "10")];
        let rows = vec![graded("j1", "s1", "q1", "0")];
        let matrix = build_result_matrix(&[entity("s1")], &questions, &rows);
        let analytics = compute_analytics(&matrix, &questions);
        assert_eq!(analytics.class_average, Some(dec("0")));
        assert_eq!(analytics.graded_entities, 1);
    }

    #[test]
    fn test_entity_results_totals() {
        let questions = vec![question("q1", "10"), question("q2", "5")];
        let rows = vec![graded("j1", "s1", "q1", "8.525"), graded("j1", "s1", "q2", "4.1")];
        let matrix = build_result_matrix(&[entity("s1")], &questions, &rows);
        let results = entity_results(&matrix, &questions);

        assert_eq!(results[0].total, dec("12.625"));
        assert_eq!(results[0].max_total, dec("15"));
        assert_eq!(results[0].cells.len(), 2);
        assert_eq!(results[0].pending_count(), 0);
    }
}
