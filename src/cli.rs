//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use bigdecimal::BigDecimal;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;

/// GradeConsensus - multi-pass AI grading with human review
///
/// Matches uploaded answer sheets to a class roster, grades them several
/// times with a local model, keeps the grades the passes agree on and
/// flags the rest for review. Markdown/JSON reports. Built in Rust.
///
/// Examples:
///   gradeconsensus --store school.json --job midterm
///   gradeconsensus --store school.json --job midterm --uploads ./scans
///   gradeconsensus --store school.json --job midterm,final --passes 5
///   gradeconsensus --store school.json --job midterm --skip-matching --skip-grading \
///       --edit-entity s1 --edit-question q2 --edit-grade 7.5
///   gradeconsensus --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// JSON snapshot holding classes, jobs, rosters and results
    #[arg(short, long, value_name = "FILE", required_unless_present = "init_config")]
    pub store: Option<PathBuf>,

    /// Job(s) to process (repeatable or comma-separated)
    ///
    /// Several jobs are processed concurrently.
    #[arg(short, long = "job", value_name = "ID", value_delimiter = ',')]
    pub jobs: Vec<String>,

    /// Directory of answer documents to attach before matching
    ///
    /// Requires exactly one --job.
    #[arg(short, long, value_name = "DIR")]
    pub uploads: Option<PathBuf>,

    /// Ollama model to use for grading
    ///
    /// Can also be set via GRADECONSENSUS_MODEL env var or .gradeconsensus.toml config.
    #[arg(short, long, env = "GRADECONSENSUS_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .gradeconsensus.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Temperature for LLM responses (0.0 - 1.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Independent AI passes per answer document
    #[arg(long, value_name = "COUNT")]
    pub passes: Option<usize>,

    /// Agreement band as a percentage of each question's max score
    #[arg(long, value_name = "PERCENT", conflicts_with = "tolerance_absolute")]
    pub tolerance_ratio: Option<f64>,

    /// Agreement band in grade points
    #[arg(long, value_name = "POINTS", conflicts_with = "tolerance_ratio")]
    pub tolerance_absolute: Option<f64>,

    /// Number of documents extracted concurrently while matching
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Number of jobs matched and graded concurrently
    #[arg(long, value_name = "NUM")]
    pub job_concurrency: Option<usize>,

    /// Do not match uploaded files to the roster
    #[arg(long)]
    pub skip_matching: bool,

    /// Do not call the AI grader
    #[arg(long)]
    pub skip_grading: bool,

    /// Entity (student or outsider id) whose grade to set
    #[arg(long, value_name = "ID", requires = "edit_question")]
    pub edit_entity: Option<String>,

    /// Question whose grade to set
    #[arg(long, value_name = "ID", requires = "edit_grade")]
    pub edit_question: Option<String>,

    /// Teacher grade to set, between 0 and the question's max score
    #[arg(long, value_name = "GRADE", requires = "edit_entity")]
    pub edit_grade: Option<BigDecimal>,

    /// Feedback stored with the teacher grade
    #[arg(long, value_name = "TEXT", requires = "edit_entity")]
    pub edit_feedback: Option<String>,

    /// Exit with code 2 if any question still needs review
    #[arg(long)]
    pub fail_on_pending: bool,

    /// Do not write results back to the store
    #[arg(long)]
    pub no_save: bool,

    /// Generate a default .gradeconsensus.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// A teacher grade requested on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct TeacherEdit {
    pub entity_id: String,
    pub question_id: String,
    pub grade: BigDecimal,
    pub feedback: Option<String>,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.jobs.iter().any(|j| j.trim().is_empty()) {
            return Err("Job ids must not be empty".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        // Validate temperature range
        if let Some(temperature) = self.temperature {
            if !(0.0..=1.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 1.0".to_string());
            }
        }

        if self.passes == Some(0) {
            return Err("Passes must be at least 1".to_string());
        }

        if self.concurrency == Some(0) || self.job_concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        for tolerance in [self.tolerance_ratio, self.tolerance_absolute].into_iter().flatten() {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err("Tolerance must be a non-negative number".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        // Validate timeout if provided
        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref uploads) = self.uploads {
            if self.jobs.len() != 1 {
                return Err("--uploads needs exactly one --job".to_string());
            }
            if !uploads.is_dir() {
                return Err(format!(
                    "Upload directory does not exist: {}",
                    uploads.display()
                ));
            }
        }

        if self.edit_entity.is_some() && self.jobs.len() != 1 {
            return Err("--edit-entity needs exactly one --job".to_string());
        }

        Ok(())
    }

    /// Drop repeated job ids, keeping the first occurrence.
    pub fn dedup_jobs(&mut self) {
        let mut seen = HashSet::new();
        self.jobs.retain(|job| seen.insert(job.clone()));
    }

    /// The teacher edit, if one was requested.
    pub fn teacher_edit(&self) -> Option<TeacherEdit> {
        Some(TeacherEdit {
            entity_id: self.edit_entity.clone()?,
            question_id: self.edit_question.clone()?,
            grade: self.edit_grade.clone()?,
            feedback: self.edit_feedback.clone(),
        })
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `--quiet` wins over a config file asking for verbose output.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
