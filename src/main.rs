//! Color checker: watches a marker region of a video stream and reports
//! whether its color matches the configured reference.

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use colorcheck::app::App;
use colorcheck::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("colorcheck=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Color checker launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!("Configuration: {:?}", config);

    let app = App::start(config).await?;

    let analysis_failed = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            false
        }
        _ = app.analysis_stopped() => true,
    };

    app.shutdown().await?;
    if analysis_failed {
        return Err(eyre!("analysis loop exited unexpectedly"));
    }

    info!("Color checker stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    Ok(())
}
