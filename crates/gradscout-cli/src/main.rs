use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gradscout_store::{ExportLedger, ListingStore};
use gradscout_sync::{
    maybe_build_scheduler, ExportCoordinator, ExportError, ExportOutcome, GoogleSheetsSink,
    IngestPipeline, MemorySink, SheetSink, SourceRegistry, SyncConfig,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gradscout")]
#[command(about = "Graduate job listing scout: dedup store and spreadsheet exports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse capture bundles for every enabled source and store new listings.
    Ingest {
        /// Captures root; defaults to GRADSCOUT_CAPTURES_DIR.
        #[arg(long)]
        captures: Option<std::path::PathBuf>,
    },
    /// Export all unpushed listings to a new spreadsheet.
    Export {
        /// Spreadsheet title; defaults to a dated one.
        #[arg(long)]
        title: Option<String>,
        /// Use an in-memory sink instead of Google Sheets.
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-apply push marks from the latest export record.
    Recover,
    /// Force every listing's push flag.
    Reset {
        #[arg(long)]
        pushed: bool,
    },
    /// Show store stats and the most recently added listings.
    View {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List recent export records.
    Exports {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        ListingStore::open(&config.data_dir)
            .await
            .context("opening listing store")?,
    );
    let ledger = Arc::new(
        ExportLedger::open(&config.data_dir)
            .await
            .context("opening export ledger")?,
    );

    match cli.command {
        Commands::Ingest { captures } => {
            let registry = SourceRegistry::load(&config.sources_file).await?;
            let pipeline = IngestPipeline::new(store, registry);
            let root = captures.unwrap_or_else(|| config.captures_dir.clone());
            let summary = pipeline.run_once(&root).await?;
            println!(
                "ingest complete: sources={} added={} duplicates={}",
                summary.sources.len(),
                summary.added(),
                summary.skipped()
            );
        }
        Commands::Export { title, dry_run } => {
            let sink = build_sink(&config, dry_run)?;
            let coordinator = ExportCoordinator::new(store, ledger, sink);

            let repaired = coordinator.recover().await?;
            if repaired > 0 {
                info!(repaired, "repaired push marks before exporting");
            }

            match coordinator.run_export(title).await {
                Ok(ExportOutcome::NothingToExport) => println!("nothing to export"),
                Ok(ExportOutcome::Exported {
                    spreadsheet_url,
                    exported,
                    ..
                }) => println!("exported {exported} listings to {spreadsheet_url}"),
                Err(ExportError::Busy) => bail!("an export cycle is already running"),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Recover => {
            let coordinator =
                ExportCoordinator::new(store, ledger, Arc::new(MemorySink::new()));
            let repaired = coordinator.recover().await?;
            println!("recovery complete: repaired={repaired}");
        }
        Commands::Reset { pushed } => {
            let changed = store.reset_all(pushed).await?;
            println!("reset complete: pushed={pushed} changed={changed}");
        }
        Commands::View { limit } => {
            let stats = store.stats().await?;
            println!("total={} unpushed={}", stats.total, stats.unpushed);
            for (source, count) in &stats.by_source {
                println!("  {source}: {count}");
            }

            let mut records = store.get_all().await?;
            records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
            for record in records.iter().take(limit) {
                println!(
                    "{} [{}] {} @ {} pushed={}",
                    record.fingerprint.short(),
                    record.source(),
                    record.listing.title(),
                    record.listing.company(),
                    record.pushed
                );
            }
        }
        Commands::Exports { days } => {
            let records = ledger.recent(days).await?;
            if records.is_empty() {
                println!("no exports in the last {days} days");
            }
            for record in records {
                println!(
                    "{} {} jobs={} {}",
                    record.export_date.format("%Y-%m-%d %H:%M"),
                    record.id,
                    record.job_count,
                    record.spreadsheet_url
                );
            }
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                bail!("set GRADSCOUT_SCHEDULER_ENABLED=1 to run the scheduler");
            }
            let sink = build_sink(&config, false)?;
            let coordinator = Arc::new(ExportCoordinator::new(store, ledger, sink));
            let Some(mut sched) = maybe_build_scheduler(&config, coordinator).await? else {
                bail!("scheduler not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.export_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn build_sink(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn SheetSink>> {
    if dry_run {
        return Ok(Arc::new(MemorySink::new()));
    }
    let token = config
        .sheets_token
        .clone()
        .context("GRADSCOUT_SHEETS_TOKEN is not set; use --dry-run to export without it")?;
    let sink = GoogleSheetsSink::new(token, Duration::from_secs(config.http_timeout_secs))?;
    Ok(Arc::new(sink))
}
