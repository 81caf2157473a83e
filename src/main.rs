//! Scenario Export Pipeline CLI
//!
//! Runs the pipeline stages individually or together against the configured stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scenario_export::pipeline::split_batch_file;
use scenario_export::{
    build_runtime, init_rayon, Config, ExportTrigger, Exporter, PipelineContext, ScenarioMerger, Scheduler,
    Spatializer, StudyArea,
};

#[derive(Parser)]
#[command(name = "scenario-export")]
#[command(about = "Spatialize, merge and export chunked climate-scenario predictions", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a batch prediction file and run it through every stage
    Run {
        /// JSON lines files, one chunk per line keyed by `instance.key`
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Scenario the batch belongs to
        #[arg(short, long)]
        scenario: String,

        /// Study area the batch covers
        #[arg(long)]
        study_area: String,

        /// Override spatialize concurrency
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Register or replace a study area from a JSON or YAML file
    RegisterStudyArea {
        file: PathBuf,
    },

    /// Spatialize one stored prediction chunk
    Spatialize {
        #[arg(short, long)]
        scenario: String,

        #[arg(long)]
        chunk: String,
    },

    /// Merge one ready scenario
    Merge {
        #[arg(short, long)]
        scenario: String,
    },

    /// Export one merged scenario
    Export {
        #[arg(short, long)]
        scenario: String,
    },

    /// Merge and export everything that is waiting
    Trigger {
        /// Keep polling until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Print scenario manifests and export records
    Status {
        /// Only this scenario
        #[arg(short, long)]
        scenario: Option<String>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => validate_command(cli.config),
        Commands::GenerateConfig { output } => generate_config_command(output),
        command => {
            let mut config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load {}", cli.config.display()))?;
            if let Commands::Run {
                concurrency: Some(c), ..
            } = &command
            {
                config.processing.spatialize_concurrency = *c;
            }
            config.validate()?;

            init_rayon(config.processing.rayon_threads)?;
            let runtime = build_runtime(config.processing.worker_threads)?;
            runtime.block_on(async {
                let ctx = PipelineContext::new(config)?;
                run_command(ctx, command).await
            })
        }
    }
}

async fn run_command(ctx: PipelineContext, command: Commands) -> Result<()> {
    match command {
        Commands::Run {
            files,
            scenario,
            study_area,
            ..
        } => {
            let area = ctx.state.load_study_area(&study_area).await?;
            let mut submissions = Vec::new();
            for file in &files {
                let contents = tokio::fs::read_to_string(file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                submissions.extend(split_batch_file(&area, &scenario, &contents)?);
            }
            tracing::info!(
                "Loaded {} of {} chunks for scenario {} from {} file(s)",
                submissions.len(),
                area.chunk_count(),
                scenario,
                files.len()
            );

            let stats = Scheduler::new(ctx).run(submissions).await?;
            println!("{}", stats);
        }

        Commands::RegisterStudyArea { file } => {
            let contents = std::fs::read_to_string(&file)?;
            let area: StudyArea = match file.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str(&contents)?,
                _ => serde_yaml::from_str(&contents)?,
            };
            ctx.state.put_study_area(&area).await?;
            println!(
                "Registered study area {} ({} chunks, {})",
                area.name,
                area.chunk_count(),
                area.crs
            );
        }

        Commands::Spatialize { scenario, chunk } => {
            let result = Spatializer::new(ctx.clone(), ctx.retry_policy())
                .spatialize_stored(&scenario, &chunk)
                .await?;
            println!(
                "Spatialized {}/{}: {} cells{}",
                scenario,
                chunk,
                result.cell_count,
                if result.scenario_ready { ", scenario ready" } else { "" }
            );
        }

        Commands::Merge { scenario } => {
            let artifact = ScenarioMerger::new(ctx.clone(), ctx.retry_policy())
                .merge(&scenario)
                .await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }

        Commands::Export { scenario } => {
            let record = Exporter::new(ctx.clone(), ctx.export_retry_policy())
                .export(&scenario)
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Trigger { watch: false } => {
            let report = ExportTrigger::new(ctx).run_once().await?;
            println!("{}", report);
        }

        Commands::Trigger { watch: true } => {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupted, finishing current pass");
                    let _ = shutdown_tx.send(()).await;
                }
            });
            let report = Scheduler::new(ctx).watch(shutdown_rx).await?;
            println!("{}", report);
        }

        Commands::Status { scenario } => {
            let ids = match scenario {
                Some(id) => vec![id],
                None => ctx.state.list_scenarios().await?,
            };
            for id in ids {
                let manifest = ctx.state.manifest(&id).await?;
                let record = ctx.state.load_export_record(&id).await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "manifest": manifest,
                        "export": record,
                    }))?
                );
            }
        }

        // Handled before the runtime starts
        Commands::Validate | Commands::GenerateConfig { .. } => {}
    }
    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Scenario Export Pipeline Configuration

# === STORAGE: Where each stage reads and writes ===
# memory://<name>, file:///<path>, s3://<bucket>/<prefix> or gs://<bucket>/<prefix>
storage:
  # Raw prediction chunks as received
  predictions: "gs://climateiq-chunk-predictions"

  # Spatialized chunk tables (h3_index,prediction,owned)
  spatialized: "gs://climateiq-spatialized-chunk-predictions"

  # Merged scenario tables (h3_index,prediction)
  merged: "gs://climateiq-spatialized-merged-predictions"

  # Manifests, export records and study areas.
  # Must support conditional writes: memory://, s3:// or gs:// (not file://)
  state: "gs://climateiq-pipeline-state/state"

# === EXPORT: Where merged scenarios are delivered ===
export:
  # Placeholders: {scenario_id}, {study_area}, {timestamp}
  destination_uri_template: "s3://climateiq-data-delivery/{study_area}/{scenario_id}.csv"

# Retry policy for storage calls
retry:
  max_attempts: 3
  initial_backoff_ms: 100
  multiplier: 2.0
  max_backoff_ms: 10000

# Retry policy for export attempts; the scenario fails once these run out
export_retry:
  max_attempts: 5
  initial_backoff_ms: 500
  multiplier: 2.0
  max_backoff_ms: 30000

# === PROCESSING: Concurrency and coordination ===
processing:
  spatialize_concurrency: 8
  merge_concurrency: 4
  export_concurrency: 4

  # Deadline for a single storage or network call
  operation_timeout_secs: 60

  # How long a merge or export claim stays valid before others may take it over
  claim_lease_secs: 600

  # Interval between trigger passes with `trigger --watch`
  poll_interval_secs: 30

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 16

  # Rayon thread pool size for H3 indexing (null = num CPUs)
  # rayon_threads: 16

  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

# === AWS: S3 connection settings ===
aws:
  region: "us-west-2"

  # Custom S3 endpoint (for LocalStack, MinIO, etc.)
  # endpoint_url: "http://localhost:4566"
  # allow_http: true
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from([
            "scenario-export",
            "run",
            "predictions-0.jsonl",
            "predictions-1.jsonl",
            "--scenario",
            "s1",
            "--study-area",
            "nyc",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { files, concurrency, .. } => {
                assert_eq!(files.len(), 2);
                assert!(concurrency.is_none());
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
    }

    #[test]
    fn test_cli_parse_trigger_watch() {
        let cli = Cli::try_parse_from(["scenario-export", "trigger", "--watch", "-c", "prod.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Trigger { watch: true }));
        assert_eq!(cli.config, PathBuf::from("prod.yaml"));
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["scenario-export"]).is_err());
        assert!(Cli::try_parse_from(["scenario-export", "merge"]).is_err());
        assert!(Cli::try_parse_from(["scenario-export", "run", "--scenario", "s1", "--study-area", "nyc"]).is_err());
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = std::env::temp_dir().join(format!("scenario-export-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.export_retry.max_attempts, 5);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
