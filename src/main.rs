//! `vantaged` – runs the observation store and serves queries over HTTP.
//!
//! ```bash
//! vantaged                 # in-memory store, defaults
//! vantaged vantage.toml    # settings from a file
//! VANTAGE__SERVER__BIND=0.0.0.0:7650 vantaged
//! ```

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantage::config::Settings;
use vantage::daemon::Daemon;
use vantage::server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "vantaged stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(path.as_deref())?;
    let daemon = Daemon::spawn(&settings.store)?;

    let app = server::router(daemon.handle());
    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(bind = %settings.server.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    tokio::task::spawn_blocking(move || daemon.shutdown()).await??;
    Ok(())
}
