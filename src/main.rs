//! GradeConsensus - multi-pass AI grading with human review
//!
//! A CLI tool that binds uploaded answer documents to a class roster,
//! grades them several times with a local Ollama model, keeps the grades
//! the passes agree on and leaves the rest for a teacher to review.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (store, config, unknown job, etc.)
//!   2 - Questions still pending review and --fail-on-pending set

mod analysis;
mod cli;
mod config;
mod consensus;
mod error;
mod extract;
mod grading;
mod intake;
mod matching;
mod models;
mod report;
mod storage;

use analysis::ResultsService;
use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::Config;
use consensus::ConsensusFinalizer;
use extract::{PlainTextExtractor, TextExtractor};
use futures::stream::{self, StreamExt};
use grading::{AiGrader, GraderConfig, GradingPipeline, OllamaGrader};
use matching::{initialize_job, DocumentMatcher, MatcherConfig};
use models::{GradingReport, JobRun, MatchReport, ReportMetadata, RunReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use storage::{MemoryStore, Storage};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let mut args = Args::parse_args();
    args.dedup_jobs();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Load configuration first so the file can turn on verbose logging
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(args.log_level(config.general.verbose));

    info!("GradeConsensus v{}", env!("CARGO_PKG_VERSION"));
    match source {
        ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
        ConfigSource::Defaults => debug!("No config file found, using defaults"),
        ConfigSource::Unreadable(e) => warn!("Failed to load config, using defaults: {}", e),
    }
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .gradeconsensus.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(config::DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::DEFAULT_CONFIG_FILE))?;

    println!(
        "✅ Created {} with default settings.",
        config::DEFAULT_CONFIG_FILE
    );
    println!("   Edit it to customize model, passes, tolerance, intake and more.");
    Ok(())
}

/// Initialize logging at `level`.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the complete workflow. Returns exit code (0 or 2).
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let tolerance = config.grading.tolerance.to_tolerance()?;

    let store_path = args
        .store
        .clone()
        .context("--store is required")?;
    let store = Arc::new(MemoryStore::load(&store_path)?);
    let storage: Arc<dyn Storage> = store.clone();
    let results = ResultsService::new(storage.clone());

    if args.jobs.is_empty() {
        print_job_list(&results).await?;
        return Ok(0);
    }

    // Step 1: Attach uploads
    if let Some(ref uploads) = args.uploads {
        let job_id = &args.jobs[0];
        println!("📥 Attaching uploads from {} to {}", uploads.display(), job_id);
        let attached = attach_uploads(storage.as_ref(), job_id, uploads, &config).await?;
        println!("   {} documents attached", attached);
    }

    // Step 2: Initialize and match every job
    let extractor: Arc<dyn TextExtractor> = Arc::new(PlainTextExtractor);
    let matcher = DocumentMatcher::new(
        storage.clone(),
        extractor.clone(),
        MatcherConfig::from(&config.matching),
    );

    if !args.skip_matching {
        println!("🔗 Matching documents to rosters...");
    }
    let job_concurrency = config.general.concurrency.max(1);
    let matching: Vec<Option<MatchReport>> = stream::iter(&args.jobs)
        .map(|job_id| prepare_job(storage.as_ref(), &matcher, job_id, args.skip_matching))
        .buffered(job_concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_>>()?;

    // Step 3: AI grading
    let grading: Vec<Option<GradingReport>> = if args.skip_grading {
        vec![None; args.jobs.len()]
    } else {
        println!("\n🤖 Grading with AI...");
        println!("   Model: {}", config.model.name);
        println!("   Ollama: {}", config.model.ollama_url);
        println!("   Passes: {}", config.grading.passes);
        println!("   Agreement band: {}", config.grading.tolerance);

        let grader: Arc<dyn AiGrader> = Arc::new(OllamaGrader::new(GraderConfig {
            ollama_url: config.model.ollama_url.clone(),
            model_name: config.model.name.clone(),
            temperature: config.model.temperature,
            timeout_seconds: config.model.timeout_seconds,
            retries: config.model.retries,
        })?);

        let pipeline = GradingPipeline::new(
            storage.clone(),
            extractor,
            grader,
            ConsensusFinalizer::new(tolerance),
        )
        .with_passes(config.grading.passes)
        .with_job_concurrency(job_concurrency)
        .with_progress(!args.quiet);

        pipeline
            .grade_jobs(&args.jobs)
            .await
            .into_iter()
            .zip(&args.jobs)
            .map(|(result, job_id)| {
                result
                    .map(Some)
                    .with_context(|| format!("Failed to grade job {}", job_id))
            })
            .collect::<Result<_>>()?
    };

    // Step 4: Teacher edit
    if let Some(edit) = args.teacher_edit() {
        let job_id = &args.jobs[0];
        let total = results
            .apply_teacher_edit(
                job_id,
                &edit.entity_id,
                &edit.question_id,
                edit.grade.clone(),
                edit.feedback.clone(),
            )
            .await
            .with_context(|| format!("Failed to set grade in job {}", job_id))?;
        println!(
            "\n✏️  Set {} / {} to {} (new total {})",
            edit.entity_id, edit.question_id, edit.grade, total
        );
    }

    // Step 5: Build the report
    println!("\n📝 Generating report...");

    let mut jobs = Vec::with_capacity(args.jobs.len());
    for ((job_id, matching), grading) in args.jobs.iter().zip(matching).zip(grading) {
        let overview = results
            .build_overview(job_id)
            .await
            .with_context(|| format!("Failed to build overview of job {}", job_id))?;
        jobs.push(JobRun {
            overview,
            matching,
            grading,
        });
    }

    let duration = start_time.elapsed().as_secs_f64();
    let report = RunReport {
        metadata: ReportMetadata {
            generated_at: Utc::now(),
            store: store_path.display().to_string(),
            model_used: config.model.name.clone(),
            passes: config.grading.passes,
            tolerance: config.grading.tolerance.to_string(),
            duration_seconds: duration,
        },
        jobs,
    };

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    let output_path = PathBuf::from(&config.general.output);
    std::fs::write(&output_path, &output)
        .with_context(|| format!("Failed to write report to {}", output_path.display()))?;

    // Step 6: Persist
    if args.no_save {
        warn!("--no-save given, results are not written back");
    } else {
        store.save(&store_path).await?;
        info!("Store saved to {}", store_path.display());
    }

    print_summary(&report);
    println!("   Duration: {:.1}s", duration);
    println!(
        "\n✅ Done! Report saved to: {}",
        output_path.display()
    );

    let pending = report.review_count();
    if args.fail_on_pending && pending > 0 {
        eprintln!(
            "\n⛔ {} questions still need review. Failing (exit code 2).",
            pending
        );
        return Ok(2);
    }

    Ok(0)
}

/// Create placeholder rows and, unless skipped, match uploaded files.
async fn prepare_job(
    storage: &dyn Storage,
    matcher: &DocumentMatcher,
    job_id: &str,
    skip_matching: bool,
) -> Result<Option<MatchReport>> {
    let created = initialize_job(storage, job_id)
        .await
        .with_context(|| format!("Failed to initialize job {}", job_id))?;
    debug!("Job {}: {} placeholder rows created", job_id, created);

    if skip_matching {
        return Ok(None);
    }

    let report = matcher
        .match_files(job_id)
        .await
        .with_context(|| format!("Failed to match files of job {}", job_id))?;
    Ok(Some(report))
}

/// Scan `dir` and attach every acceptable document to `job_id`.
async fn attach_uploads(
    storage: &dyn Storage,
    job_id: &str,
    dir: &Path,
    config: &Config,
) -> Result<usize> {
    let scanner = intake::UploadScanner::new(
        dir.to_path_buf(),
        intake::ScanConfig::from(&config.intake),
    );
    let files = scanner.scan()?;

    for file in &files {
        storage
            .attach_file(job_id, file.clone())
            .await
            .with_context(|| format!("Failed to attach {} to job {}", file.path, job_id))?;
    }

    Ok(files.len())
}

/// Print progress of every job in the store.
async fn print_job_list(results: &ResultsService) -> Result<()> {
    let summaries = results.job_summaries().await?;

    if summaries.is_empty() {
        println!("No jobs in store.");
        return Ok(());
    }

    println!("📋 Jobs:\n");
    for summary in summaries {
        println!(
            "   {} ({}) | {} | {} | {}/{} processed",
            summary.name,
            summary.id,
            summary.class_name,
            summary.status,
            summary.progress.processed,
            summary.progress.total
        );
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("\n📊 Grading Summary:");
    for job in &report.jobs {
        let summary = &job.overview.summary;
        println!(
            "   {} [{}]: {}/{} processed, {} pending review",
            summary.name,
            summary.status,
            summary.progress.processed,
            summary.progress.total,
            job.review_count()
        );
        if let Some(ref matching) = job.matching {
            println!(
                "     - 🔗 {} bound | 👤 {} outsiders | ⚠️  {} failed",
                matching.bound.len(),
                matching.outsiders.len(),
                matching.failures.len()
            );
        }
        if let Some(ref grading) = job.grading {
            println!(
                "     - 🤖 {} AI graded | 🟠 {} pending review",
                grading.ai_graded(),
                grading.pending_review()
            );
        }
    }
}

/// Where the configuration came from.
enum ConfigSource {
    File(PathBuf),
    Defaults,
    /// The default file exists but could not be loaded.
    Unreadable(anyhow::Error),
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is set up, so the source is returned for logging later.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::File(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((
            config,
            ConfigSource::File(PathBuf::from(config::DEFAULT_CONFIG_FILE)),
        )),
        Ok(None) => Ok((Config::default(), ConfigSource::Defaults)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(e))),
    }
}
