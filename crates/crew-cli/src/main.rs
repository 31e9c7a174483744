use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crew_core::JobId;
use crew_engine::{
    create_job, job_status, load_field_map, Coordinator, EngineConfig, RowProcessor,
};
use crew_enrich::{HttpEnricher, RetryPolicy};
use crew_store::{decode_table, JobStore};

#[derive(Debug, Parser)]
#[command(name = "crew-cli")]
#[command(about = "CREW checkpointed row-enrichment command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve,
    /// Create a job from a CSV input file.
    Create { input: PathBuf },
    /// Run (or resume) a job to completion.
    Run { job_id: String },
    /// Print a job's progress as JSON.
    Status { job_id: String },
}

fn build_coordinator(config: &EngineConfig, store: &JobStore) -> Result<Coordinator> {
    let enricher = Arc::new(HttpEnricher::new(config.enricher_config())?);
    let field_map = load_field_map(config.mapping_path.as_deref())?;
    let processor = Arc::new(RowProcessor::new(enricher, RetryPolicy::default(), field_map));
    Ok(Coordinator::new(
        store.clone(),
        processor,
        config.worker_cap,
        config.checkpoint_every,
    ))
}

fn parse_job_id(text: &str) -> Result<JobId> {
    text.parse()
        .with_context(|| format!("invalid job id {text:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let store = JobStore::new(config.data_dir.clone());

    match cli.command {
        Commands::Serve => {
            crew_web::serve_from_env().await?;
        }
        Commands::Create { input } => {
            let bytes = std::fs::read(&input)
                .with_context(|| format!("reading input file {}", input.display()))?;
            let table = decode_table(&bytes)
                .with_context(|| format!("parsing input file {}", input.display()))?;
            let id = create_job(&store, &table, &config.key_column).await?;
            println!("job created: id={} rows={}", id, table.row_count());
        }
        Commands::Run { job_id } => {
            let id = parse_job_id(&job_id)?;
            let coordinator = build_coordinator(&config, &store)?;
            let summary = coordinator.run(&id).await?;
            println!(
                "run complete: job_id={} run_id={} processed={} degraded={} checkpoints={} complete={}",
                summary.job_id,
                summary.run_id,
                summary.rows_processed,
                summary.degraded_rows,
                summary.checkpoints_written,
                summary.complete
            );
        }
        Commands::Status { job_id } => {
            let id = parse_job_id(&job_id)?;
            let view = job_status(&store, &id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
