//! liverelay server entry point.

mod app;
mod config;
mod logging;

use std::path::PathBuf;

use clap::Parser;

/// HTTP upload server that relays in-flight uploads to downloaders live.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path of the TOML configuration file (created with defaults if missing).
    #[arg(short, long, default_value = "liverelay.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging is not up yet; config errors surface through anyhow.
    let config = config::Config::load(&args.config)?;

    let _log_guard = logging::init(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting liverelay"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;
    rt.block_on(app::run(config))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}
