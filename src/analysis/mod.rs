//! Results aggregation.
//!
//! Pure functions that turn persisted result rows into a dense matrix, job
//! summaries and analytics live in [`aggregator`]; [`overview`] wires them to
//! storage for the reviewer-facing operations.

pub mod aggregator;
pub mod overview;

pub use aggregator::*;
pub use overview::ResultsService;
