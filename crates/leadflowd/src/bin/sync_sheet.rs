//! One-shot sheet synchronization, for operators and cron.

use anyhow::Context;
use clap::Parser;
use leadflowd::config::Settings;
use leadflowd::querygen::{QueryGenerator, QueryGeneratorConfig};
use leadflowd::sheets::{GoogleSheetAdapter, SheetSyncService};
use tracing_subscriber::EnvFilter;

/// Synchronize the niches sheet into the query queue.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Only process rows carrying this batch tag.
    #[arg(long)]
    batch_tag: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("loading configuration")?;
    let pool = leadflowd::db::connect(&settings.database).await?;

    let adapter = GoogleSheetAdapter::from_settings(&settings.sheets)
        .context("building the Google Sheets adapter")?;
    let mut service = SheetSyncService::new(
        Box::new(adapter),
        QueryGenerator::new(QueryGeneratorConfig::default()),
    );

    let summary = service.sync(&pool, opts.batch_tag.as_deref()).await?;
    tracing::info!(
        "done: {} rows processed, {} queries inserted, {} duplicates, {} errors",
        summary.processed_rows,
        summary.inserted_queries,
        summary.duplicate_queries,
        summary.errors
    );

    if summary.errors > 0 {
        anyhow::bail!("{} rows failed", summary.errors);
    }
    Ok(())
}
