//! KBC CLI - Command-line interface
//!
//! Usage:
//!   kbc run --config pipeline.toml [--store data] [--concurrency 4] [--fail-fast]
//!   kbc plan --config pipeline.toml
//!   kbc check --config pipeline.toml

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use kbc_core::{FailurePolicy, LoggingConfig, PipelineConfig, PipelineDefinition, StorageKind};
use kbc_pipeline::{
    default_working_dir, resolve, FunctionRegistry, JsonReporter, Pipeline, RunCoordinator,
    RunOptions, RunReporter, TextReporter, TracingReporter,
};

#[derive(Parser)]
#[command(name = "kbc")]
#[command(about = "Knowledge-base construction pipeline runner")]
#[command(version)]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, default_value = "pipeline.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of the pipeline
    Run {
        /// Data directory of the JSON-lines store
        #[arg(long)]
        store: Option<PathBuf>,

        /// Keep relations in memory only
        #[arg(long, conflicts_with = "store")]
        memory: bool,

        /// Maximum number of stages running at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Abort the run on the first failed stage
        #[arg(long)]
        fail_fast: bool,

        /// Summary format
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        report: ReportFormat,
    },
    /// Print the resolved execution order
    Plan,
    /// Validate configuration, dependencies and unit references
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
    Log,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_file(&cli.config)?.with_env_override()?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            store,
            memory,
            concurrency,
            fail_fast,
            report,
        } => {
            match store {
                Some(path) => {
                    config.storage.kind = StorageKind::Jsonl;
                    config.storage.path = path;
                }
                // Configured data directories are relative to the config file
                None if config.storage.path.is_relative() => {
                    let base = default_working_dir(&cli.config);
                    config.storage.path = base.join(&config.storage.path);
                }
                None => {}
            }
            if memory {
                config.storage.kind = StorageKind::Memory;
            }
            if let Some(n) = concurrency {
                config.runner.concurrency = n;
            }
            if fail_fast {
                config.runner.failure_policy = FailurePolicy::Abort;
            }
            run(&cli.config, &config, report).await
        }
        Commands::Plan => plan(&config),
        Commands::Check => check(&cli.config, &config),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_pipeline(config_path: &Path, config: &PipelineConfig) -> anyhow::Result<Pipeline> {
    let definition = PipelineDefinition::from_config(config)?;

    let mut registry = FunctionRegistry::new();
    registry.register_all(kbc_extractor::builtins());

    let working_dir = match &config.runner.working_dir {
        Some(dir) if dir.is_relative() => default_working_dir(config_path).join(dir),
        Some(dir) => dir.clone(),
        None => default_working_dir(config_path),
    };

    Ok(Pipeline::build(definition, &registry, Some(&working_dir))?)
}

async fn run(
    config_path: &Path,
    config: &PipelineConfig,
    format: ReportFormat,
) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config_path, config)?;
    let storage = kbc_storage::open_storage(&config.storage)
        .await
        .with_context(|| format!("opening {:?} storage", config.storage.kind))?;

    let options = RunOptions::from(&config.runner);
    let coordinator = RunCoordinator::with_options(pipeline, storage, options);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let summary = coordinator.run_with_cancel(cancel).await?;

    let reporter: Box<dyn RunReporter> = match format {
        ReportFormat::Text => Box::new(TextReporter::new(std::io::stdout())),
        ReportFormat::Json => Box::new(JsonReporter::new(std::io::stdout())),
        ReportFormat::Log => Box::new(TracingReporter),
    };
    reporter.report(&summary)?;

    if !summary.is_success() {
        let unsuccessful = summary.stages.len() - summary.count(kbc_core::StageStatus::Success);
        anyhow::bail!(
            "{unsuccessful} of {} stages did not succeed",
            summary.stages.len()
        );
    }
    Ok(())
}

fn plan(config: &PipelineConfig) -> anyhow::Result<()> {
    let definition = PipelineDefinition::from_config(config)?;
    let plan = resolve(&definition)?;

    println!("Pipeline: {}", definition.name());
    for (i, stage) in plan.order().iter().enumerate() {
        let deps = plan.dependencies(stage);
        if deps.is_empty() {
            println!("  {:>2}. {stage}", i + 1);
        } else {
            println!("  {:>2}. {stage} (after {})", i + 1, deps.join(", "));
        }
    }

    println!("Waves:");
    for (level, wave) in plan.levels().iter().enumerate() {
        println!("  {level}: {}", wave.join(", "));
    }
    Ok(())
}

fn check(config_path: &Path, config: &PipelineConfig) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config_path, config)?;
    let plan = resolve(pipeline.definition())?;

    for stage in plan.order() {
        if let Some(unit) = pipeline.unit(stage) {
            println!("  {stage}: {}", unit.describe());
        }
    }
    println!(
        "ok: {} stages, holdout fraction {}",
        plan.len(),
        pipeline.definition().inference().holdout_fraction
    );
    Ok(())
}
