use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use image_gateway::{router, storage, AppState, Config};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested, draining in-flight requests");
}

async fn run(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    // runs the webserver until a shutdown signal arrives
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "server initialized");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    drop(dotenv());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("image_gateway=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    storage::prepare_directories(&config)
        .await
        .context("failed to create storage directories")?;

    info!(
        uploads = %config.upload_dir.display(),
        processed = %config.processed_dir.display(),
        timeout = ?config.process_timeout,
        max_jobs = config.max_concurrent_jobs,
        upscale = %config.upscale_delivery,
        remove_bg = %config.remove_bg_delivery,
        convert = %config.convert_delivery,
        "configuration loaded"
    );

    let addr = config.addr;
    let app = router(AppState::from_config(config));

    run(app, addr).await
}
