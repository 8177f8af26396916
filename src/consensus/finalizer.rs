//! Consensus finalizer.
//!
//! Finds the largest group of AI samples that agree with each other within a
//! tolerance band and averages it with exact decimal arithmetic.

use crate::models::{ConsensusResult, GradeSample, ResultStatus};
use bigdecimal::{BigDecimal, Zero};
use std::ops::Range;
use tracing::debug;

/// Minimum number of agreeing samples before a grade is trusted.
pub const MIN_AGREEING_SAMPLES: usize = 2;

/// Width of the acceptance band for "the graders agree".
#[derive(Debug, Clone, PartialEq)]
pub enum Tolerance {
    /// Percentage of the question's max score (1.5 means 1.5%).
    Ratio(BigDecimal),
    /// Fixed band in grade points regardless of max score.
    Absolute(BigDecimal),
}

impl Default for Tolerance {
    fn default() -> Self {
        // 1.5% of max score: 0.15 points on a 10 point question.
        Tolerance::Ratio(BigDecimal::new(15.into(), 1))
    }
}

impl Tolerance {
    /// Band in grade points for a question worth `max_score`.
    pub fn band(&self, max_score: &BigDecimal) -> BigDecimal {
        match self {
            Tolerance::Ratio(percent) => max_score * percent / BigDecimal::from(100),
            Tolerance::Absolute(points) => points.clone(),
        }
    }
}

/// Reduces grade samples for one question into a [`ConsensusResult`].
#[derive(Debug, Clone, Default)]
pub struct ConsensusFinalizer {
    tolerance: Tolerance,
}

impl ConsensusFinalizer {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    /// Reconcile `samples` for a question worth `max_score`.
    ///
    /// Samples without a value, or with a value outside `[0, max_score]`,
    /// do not count as evidence. With fewer than two usable samples, or no
    /// two samples within the tolerance band, the question goes to review.
    pub fn finalize(&self, samples: &[GradeSample], max_score: &BigDecimal) -> ConsensusResult {
        let zero = BigDecimal::zero();
        let mut valid: Vec<(usize, &BigDecimal)> = samples
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_ref().map(|v| (i, v)))
            .filter(|(_, v)| *v >= &zero && *v <= max_score)
            .collect();

        if valid.len() < MIN_AGREEING_SAMPLES {
            debug!(
                "Only {} usable sample(s) of {}, deferring to review",
                valid.len(),
                samples.len()
            );
            return ConsensusResult::pending_review();
        }

        valid.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0)));
        let values: Vec<&BigDecimal> = valid.iter().map(|(_, v)| *v).collect();
        let band = self.tolerance.band(max_score);

        let cluster = match largest_cluster(&values, &band) {
            Some(range) if range.len() >= MIN_AGREEING_SAMPLES => range,
            _ => {
                debug!("No two samples within {} of each other", band);
                return ConsensusResult::pending_review();
            }
        };

        let members = &valid[cluster];
        let sum = members
            .iter()
            .fold(BigDecimal::zero(), |acc, (_, v)| acc + *v);
        let mean = (sum / BigDecimal::from(members.len() as u64)).normalized();

        // Commentary from the earliest pass that took part in the agreement.
        let feedback = members
            .iter()
            .map(|(i, _)| *i)
            .min()
            .map(|i| samples[i].comment.trim().to_string())
            .filter(|c| !c.is_empty());

        debug!(
            "{} of {} samples agree, consensus grade {}",
            members.len(),
            samples.len(),
            mean
        );
        ConsensusResult::ai_graded(mean, feedback)
    }

    /// Teacher override. Always final, bypasses sample reconciliation.
    pub fn apply_override(grade: BigDecimal, feedback: Option<String>) -> ConsensusResult {
        ConsensusResult::teacher_graded(grade, feedback)
    }
}

/// Whether an AI pass may write over a cell currently in `status`.
pub fn accepts_ai_update(status: ResultStatus) -> bool {
    status != ResultStatus::TeacherGraded
}

/// Largest window of `sorted` values whose spread is within `band`.
///
/// On sorted input "every pair within band" is the same as "max - min within
/// band", so the largest agreement cluster is always a contiguous window.
/// Ties on size go to the tightest window, then to the lowest one.
fn largest_cluster(sorted: &[&BigDecimal], band: &BigDecimal) -> Option<Range<usize>> {
    let mut best: Option<(Range<usize>, BigDecimal)> = None;
    let mut start = 0;

    for end in 0..sorted.len() {
        while sorted[end] - sorted[start] > *band {
            start += 1;
        }

        let spread = sorted[end] - sorted[start];
        let len = end + 1 - start;
        let better = match &best {
            None => true,
            Some((range, best_spread)) => {
                len > range.len() || (len == range.len() && spread < *best_spread)
            }
        };
        if better {
            best = Some((start..end + 1, spread));
        }
    }

    best.map(|(range, _)| range)
}
