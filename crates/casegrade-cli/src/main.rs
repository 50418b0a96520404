//! casegrade CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use casegrade_core::{parse_and_validate, CaseInput, EvaluationJob, RubricDocument};
use casegrade_runtime::{
    BatchOrchestrator, BatchSummary, CaseEvaluator, MemoryStore, OutcomeStore, ProviderRegistry,
    RuntimeConfig, UsageSummary,
};

#[derive(Parser)]
#[command(name = "casegrade")]
#[command(about = "Rubric-driven scoring of model-evaluated medical cases")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the criteria parsed from a rubric document
    Rubric {
        /// Path to the rubric document
        path: PathBuf,
    },

    /// List the inference providers this build can create
    Providers,

    /// Score a saved model response against a rubric, without calling a model
    Score {
        #[arg(short, long)]
        rubric: PathBuf,

        /// File holding the raw model response
        #[arg(long)]
        response: PathBuf,
    },

    /// Evaluate a batch of cases end to end
    Run {
        #[arg(short, long)]
        rubric: PathBuf,

        /// JSON array of {case_id, summary, recommendation}
        #[arg(long)]
        cases: PathBuf,

        /// YAML runtime configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Provider type, overriding the configuration
        #[arg(long)]
        provider: Option<String>,

        /// SQLite database for jobs and outcomes (requires the `sqlite` feature)
        #[arg(long)]
        database: Option<PathBuf>,

        /// Job id, generated from the current time when omitted
        #[arg(long)]
        job_id: Option<String>,
    },
}

#[derive(Serialize)]
struct RunReport {
    summary: BatchSummary,
    usage: UsageSummary,
}

#[derive(Serialize)]
struct ProviderListing<'a> {
    provider_type: &'a str,
    description: &'static str,
    default_config: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Rubric { path } => show_rubric(&path),
        Commands::Providers => list_providers(),
        Commands::Score { rubric, response } => score_response(&rubric, &response),
        Commands::Run {
            rubric,
            cases,
            config,
            provider,
            database,
            job_id,
        } => run_batch(&rubric, &cases, config, provider, database, job_id).await,
    }
}

fn show_rubric(path: &Path) -> Result<()> {
    let rubric = RubricDocument::load(path)
        .with_context(|| format!("Failed to load rubric {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&rubric.schema)?);
    Ok(())
}

fn list_providers() -> Result<()> {
    let registry = ProviderRegistry::with_defaults();
    let listings: Vec<ProviderListing<'_>> = registry
        .available_types()
        .into_iter()
        .map(|provider_type| ProviderListing {
            provider_type,
            description: registry.description(provider_type).unwrap_or_default(),
            default_config: registry.default_config(provider_type).unwrap_or_default(),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listings)?);
    Ok(())
}

fn score_response(rubric_path: &Path, response_path: &Path) -> Result<()> {
    let rubric = RubricDocument::load(rubric_path)
        .with_context(|| format!("Failed to load rubric {}", rubric_path.display()))?;
    let raw = std::fs::read_to_string(response_path)
        .with_context(|| format!("Failed to read response {}", response_path.display()))?;

    let outcome = parse_and_validate(&raw, &rubric.schema);
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_batch(
    rubric: &Path,
    cases_path: &Path,
    config_path: Option<PathBuf>,
    provider_type: Option<String>,
    database: Option<PathBuf>,
    job_id: Option<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => RuntimeConfig::from_yaml_file(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RuntimeConfig::from_env()?,
    };
    if let Some(provider_type) = provider_type {
        config.provider = provider_type;
    }

    let raw_cases = std::fs::read_to_string(cases_path)
        .with_context(|| format!("Failed to read cases {}", cases_path.display()))?;
    let cases: Vec<CaseInput> =
        serde_json::from_str(&raw_cases).context("Cases file must be a JSON array of cases")?;

    let provider = ProviderRegistry::with_defaults()
        .create(&config.provider, &config.provider_options)
        .context("Failed to create inference provider")?;
    if !provider.health_check().await {
        tracing::warn!(provider = provider.name(), "Provider health check failed");
    }

    let store = open_store(database)?;
    let job_id = job_id.unwrap_or_else(|| format!("job-{}", Utc::now().format("%Y%m%d%H%M%S")));
    let job = EvaluationJob::new(
        job_id.clone(),
        rubric.display().to_string(),
        config.default_model.clone(),
        cases.len(),
    );
    store.create_job(&job).await?;
    tracing::info!(job_id = %job_id, cases = cases.len(), model = %job.model, "Created job");

    let evaluator = Arc::new(CaseEvaluator::new(provider, config));
    let orchestrator = BatchOrchestrator::builder(evaluator.clone(), store).build();
    let summary = orchestrator.run_job(&job_id, &cases, rubric).await?;
    tracing::info!(
        job_id = %job_id,
        status = %summary.status,
        successful = summary.successful,
        failed = summary.failed,
        "Run finished"
    );

    let report = RunReport {
        summary,
        usage: evaluator.usage().summary(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(feature = "sqlite")]
fn open_store(database: Option<PathBuf>) -> Result<Arc<dyn OutcomeStore>> {
    match database {
        Some(path) => {
            let store = casegrade_runtime::SqliteStore::open(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
fn open_store(database: Option<PathBuf>) -> Result<Arc<dyn OutcomeStore>> {
    if database.is_some() {
        anyhow::bail!("--database requires casegrade to be built with the `sqlite` feature");
    }
    Ok(Arc::new(MemoryStore::new()))
}
