use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::ingest::{DEFAULT_MAX_FRAME_LEN, IngestServer};
use crate::prelude::*;
use crate::store::{LogHandle, LogService, Notifier, RecordStore};
use crate::web;
use clap::Parser;
use proctree_shared::protocol::{DEFAULT_INGEST_PORT, DEFAULT_WEB_PORT};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Collects process-tree snapshots from a tracing agent and serves them to live viewers"
)]
pub struct Cli {
    /// Address of the HTTP server exposing the stored snapshots and live count updates
    #[arg(
        long,
        env = "PROCTREE_WEB_ADDR",
        default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEB_PORT))
    )]
    pub web_addr: SocketAddr,

    /// Address the tracing agent connects to
    #[arg(
        long,
        env = "PROCTREE_INGEST_ADDR",
        default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_INGEST_PORT))
    )]
    pub ingest_addr: SocketAddr,

    /// Directory holding one JSON file per snapshot. It is deleted on shutdown.
    #[arg(long, env = "PROCTREE_LOGS_DIR", default_value = "logs")]
    pub logs_dir: PathBuf,

    /// Largest accepted snapshot line, in bytes
    #[arg(long, env = "PROCTREE_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Index snapshots left over from a previous session instead of deleting them
    #[arg(long, env = "PROCTREE_KEEP_LOGS")]
    pub keep_logs: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = ServerConfig::try_from(&cli)?;
    debug!("Starting with {config:?}");

    let store = RecordStore::open(&config.logs_dir, config.store_mode).with_context(|| {
        format!(
            "Failed to open the logs directory {}",
            config.logs_dir.display()
        )
    })?;
    let (log, service) = LogService::spawn(store, Notifier::default());

    let (ingest, web_listener) = match bind_listeners(&config, &log).await {
        Ok(listeners) => listeners,
        Err(err) => {
            if let Err(cleanup) = log.shutdown().await {
                warn!("Failed to delete the logs directory: {cleanup}");
            }
            return Err(err);
        }
    };

    let cancel = CancellationToken::new();
    let ingest_task = tokio::spawn(ingest.run(cancel.child_token()));
    let web_task = tokio::spawn(web::serve(web_listener, log.clone(), cancel.child_token()));

    if let Err(e) = shutdown_signal().await {
        error!("Failed to listen for shutdown signals: {e}");
    }
    info!("Caught interrupt signal. Deleting logs...");

    cancel.cancel();
    if let Err(e) = ingest_task.await {
        warn!("TCP server for tracer panicked: {e}");
    }
    match web_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Web server stopped with an error: {e}"),
        Err(e) => warn!("Web server panicked: {e}"),
    }

    log.shutdown().await.context("Failed to delete the logs directory")?;
    if let Err(e) = service.await {
        warn!("Log service panicked: {e}");
    }
    info!("Logs directory deleted.");

    Ok(())
}

async fn bind_listeners(
    config: &ServerConfig,
    log: &LogHandle,
) -> Result<(IngestServer, TcpListener)> {
    let ingest = IngestServer::bind(config.ingest_addr, config.ingest.clone(), log.clone()).await?;

    let web = TcpListener::bind(config.web_addr)
        .await
        .with_context(|| format!("Failed to bind the web server to {}", config.web_addr))?;
    info!("Web server is running on http://{}", web.local_addr()?);

    Ok((ingest, web))
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await
}
