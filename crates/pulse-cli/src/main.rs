use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_core::SourceKind;
use pulse_storage::{connect_with_retry, ensure_schema};
use pulse_sync::{
    report_recent_markdown, IngestConfig, IngestPipeline, JobScheduler, RunOptions, RunReport, SourceRegistry,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pulse")]
#[command(about = "Trend Pulse ingestion runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Limit the run to these sources (news, guardian, reddit, trends).
        #[arg(long = "source", value_name = "SOURCE")]
        sources: Vec<SourceKind>,
        /// Comma-separated keywords; skips the trends stage.
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
    },
    /// Create the article tables.
    Migrate,
    /// Run on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Print a summary of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = IngestConfig::from_env();
    pulse_sync::logging::init(&config.log_filter)?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run {
        sources: Vec::new(),
        keywords: Vec::new(),
    }) {
        Commands::Run { sources, keywords } => {
            let registry = SourceRegistry::load(&config.registry_path())?;
            let pipeline = Arc::new(IngestPipeline::connect(config, &registry).await?);
            let abort = pipeline.abort_handle();
            let interrupted = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current stage");
                    abort.abort();
                }
            });
            let report = pipeline.run_once(&RunOptions { sources, keywords }).await?;
            print_summary(&report);

            if pipeline.abort_handle().is_aborted() {
                return Ok(());
            }
            match pipeline.maybe_build_scheduler().await? {
                Some(scheduler) => {
                    run_scheduled(&pipeline, scheduler, async move {
                        let _ = interrupted.await;
                    })
                    .await?
                }
                None => interrupted.abort(),
            }
        }
        Commands::Migrate => {
            let pool = connect_with_retry(&config.database_url, &config.connect_retry_policy())
                .await
                .context("connecting to database")?;
            ensure_schema(&pool).await.context("creating tables")?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Schedule => {
            let registry = SourceRegistry::load(&config.registry_path())?;
            let pipeline = Arc::new(IngestPipeline::connect(config, &registry).await?);
            let scheduler = pipeline.build_scheduler().await?;
            let abort = pipeline.abort_handle();
            run_scheduled(&pipeline, scheduler, async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    abort.abort();
                }
            })
            .await?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.reports_root())?);
        }
    }

    Ok(())
}

/// Keep the cron job running until `stop` resolves.
async fn run_scheduled(
    pipeline: &IngestPipeline,
    mut scheduler: JobScheduler,
    stop: impl std::future::Future<Output = ()>,
) -> Result<()> {
    scheduler.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config().sync_cron, "scheduler running; Ctrl-C to stop");
    stop.await;
    pipeline.abort_handle().abort();
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!(
        "run {} finished in stage {} (keywords: {})",
        report.run_id,
        report.stage,
        report.keywords.join(", ")
    );
    for source in &report.sources {
        let state = if source.succeeded() { "ok" } else { "failed" };
        println!(
            "  {:<8} {:<6} fetched={} excluded={} dropped={} inserted={} duplicates={}",
            source.source.as_str(),
            state,
            source.fetched,
            source.excluded,
            source.dropped,
            source.inserted,
            source.duplicates
        );
    }
    if let Some(failure) = &report.failure {
        println!("  failure: {failure}");
    }
}
