//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.gradeconsensus.toml` files.

use crate::consensus::Tolerance;
use anyhow::{bail, Context, Result};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Name of the configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = ".gradeconsensus.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Consensus grading settings.
    #[serde(default)]
    pub grading: GradingConfig,

    /// Document matching settings.
    #[serde(default)]
    pub matching: MatchingConfig,

    /// Upload intake settings.
    #[serde(default)]
    pub intake: IntakeConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Jobs matched and graded at the same time.
    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            concurrency: default_job_concurrency(),
        }
    }
}

fn default_job_concurrency() -> usize {
    crate::grading::pipeline::DEFAULT_JOB_CONCURRENCY
}

fn default_output() -> String {
    "grading_report.md".to_string()
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of retries on transport failure.
    #[serde(default = "default_retries")]
    pub retries: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_timeout() -> u64 {
    300
}

fn default_retries() -> usize {
    2
}

/// Width of the agreement band, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceConfig {
    /// Percent of a question's max score.
    Ratio(f64),
    /// Grade points.
    Absolute(f64),
}

impl Default for ToleranceConfig {
    fn default() -> Self {
        ToleranceConfig::Ratio(1.5)
    }
}

impl fmt::Display for ToleranceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToleranceConfig::Ratio(percent) => write!(f, "{}% of max score", percent),
            ToleranceConfig::Absolute(points) => write!(f, "{} points", points),
        }
    }
}

impl ToleranceConfig {
    /// Exact decimal tolerance. Goes through the float's shortest textual
    /// form so `1.5` becomes exactly 1.5.
    pub fn to_tolerance(self) -> Result<Tolerance> {
        let (raw, wrap): (f64, fn(BigDecimal) -> Tolerance) = match self {
            ToleranceConfig::Ratio(v) => (v, Tolerance::Ratio),
            ToleranceConfig::Absolute(v) => (v, Tolerance::Absolute),
        };

        if !raw.is_finite() || raw < 0.0 {
            bail!("Tolerance must be a non-negative number, got {}", raw);
        }

        let value = BigDecimal::from_str(&raw.to_string())
            .with_context(|| format!("Invalid tolerance: {}", raw))?;
        Ok(wrap(value))
    }
}

/// Consensus grading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    /// Independent AI passes per answer document.
    #[serde(default = "default_passes")]
    pub passes: usize,

    /// Agreement band between passes.
    #[serde(default)]
    pub tolerance: ToleranceConfig,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            passes: default_passes(),
            tolerance: ToleranceConfig::default(),
        }
    }
}

fn default_passes() -> usize {
    crate::grading::pipeline::DEFAULT_PASSES
}

/// Document matching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Prefix of generated outsider ids.
    #[serde(default = "default_outsider_id_prefix")]
    pub outsider_id_prefix: String,

    /// Display name prefix of outsiders, followed by a number.
    #[serde(default = "default_outsider_name_prefix")]
    pub outsider_name_prefix: String,

    /// Number of documents extracted concurrently.
    #[serde(default = "default_concurrency")]
    pub extraction_concurrency: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            outsider_id_prefix: default_outsider_id_prefix(),
            outsider_name_prefix: default_outsider_name_prefix(),
            extraction_concurrency: default_concurrency(),
        }
    }
}

fn default_outsider_id_prefix() -> String {
    "outsider::".to_string()
}

fn default_outsider_name_prefix() -> String {
    "Outsider".to_string()
}

fn default_concurrency() -> usize {
    4
}

impl From<&MatchingConfig> for crate::matching::MatcherConfig {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            outsider_id_prefix: config.outsider_id_prefix.clone(),
            outsider_name_prefix: config.outsider_name_prefix.clone(),
            extraction_concurrency: config.extraction_concurrency,
        }
    }
}

/// Upload intake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// File and directory names to skip.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,

    /// Maximum file size in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// File extension (without dot) to content type.
    #[serde(default = "crate::intake::default_content_types")]
    pub content_types: BTreeMap<String, String>,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            excludes: default_excludes(),
            max_file_size: default_max_file_size(),
            content_types: crate::intake::default_content_types(),
        }
    }
}

fn default_excludes() -> Vec<String> {
    vec!["__MACOSX", "Thumbs.db"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only values given explicitly on the command line (or through their
    /// environment variables) override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(passes) = args.passes {
            self.grading.passes = passes;
        }
        if let Some(ratio) = args.tolerance_ratio {
            self.grading.tolerance = ToleranceConfig::Ratio(ratio);
        } else if let Some(points) = args.tolerance_absolute {
            self.grading.tolerance = ToleranceConfig::Absolute(points);
        }

        if let Some(concurrency) = args.concurrency {
            self.matching.extraction_concurrency = concurrency;
        }

        if let Some(jobs) = args.job_concurrency {
            self.general.concurrency = jobs;
        }

        if let Some(ref output) = args.output {
            self.general.output = output.to_string_lossy().to_string();
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
