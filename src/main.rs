//! Argus multi-stream motion pipeline

use std::path::PathBuf;

use argus::pipeline::{Collaborators, Pipeline};
use argus::{control, Settings};
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Settings file (TOML, JSON, or a bare JSON array of streams)
    settings: PathBuf,
    /// Save motion snapshots under this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Log filter, e.g. "argus=debug"
    #[arg(long, env = "ARGUS_LOG", default_value = "argus=info")]
    log_filter: String,
    /// Leave failed streams down instead of restarting them
    #[arg(long)]
    no_auto_restart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    let mut settings = Settings::load(&args.settings)
        .wrap_err_with(|| format!("failed to load {}", args.settings.display()))?;
    if let Some(dir) = args.snapshot_dir {
        settings.output.snapshot_dir = Some(dir);
    }
    if args.no_auto_restart {
        settings.health.auto_restart = false;
    }

    let collaborators = Collaborators::standard(&settings)?;
    let pipeline = Pipeline::start(&settings, collaborators).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.wrap_err("failed to listen for Ctrl-C")?;
            info!("Interrupt received");
        }
        _ = control::console(pipeline.handle()) => {}
    }

    pipeline.shutdown().await?;
    info!("Argus shut down cleanly");
    Ok(())
}
