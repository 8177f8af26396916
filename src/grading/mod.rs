//! AI grading.
//!
//! This module provides the AI grader collaborator (with an Ollama backed
//! implementation), prompt construction and tolerant response parsing, and
//! the per-job pipeline that turns several grading passes into consensus
//! results.

pub mod client;
pub mod pipeline;
pub mod prompt;

pub use client::{AiGrader, GraderConfig, OllamaGrader};
pub use pipeline::GradingPipeline;
