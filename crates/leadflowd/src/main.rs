use anyhow::Context;
use clap::{Parser, ValueEnum};
use leadflowd::config::Settings;
use leadflowd::orchestrator::{OrchestratorConfig, PipelineOrchestrator};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run a single orchestration tick and exit.
    Once,
    /// Tick forever, sleeping `--poll-interval` between ticks.
    Loop,
}

/// Lead generation pipeline daemon.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Run mode.
    #[arg(long, value_enum, default_value = "loop")]
    mode: Mode,

    /// Seconds to sleep between ticks in loop mode.
    #[arg(long, default_value = "60")]
    poll_interval: u64,

    /// How many entities each stage handles per tick.
    #[arg(long, default_value = "5")]
    batch_size: i64,
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

    let mut orchestrator = PipelineOrchestrator::new(
        &settings,
        pool,
        OrchestratorConfig {
            batch_size: opts.batch_size,
            poll_interval: Duration::from_secs(opts.poll_interval),
        },
    )
    .context("building the pipeline orchestrator")?;

    match opts.mode {
        Mode::Once => orchestrator.run_once().await,
        Mode::Loop => orchestrator.run_forever().await,
    }

    Ok(())
}
