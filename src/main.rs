use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fuzzy_search_server::broker::{Broker, LocalBroker};
use fuzzy_search_server::config::Config;
use fuzzy_search_server::db::Database;
use fuzzy_search_server::{api, cron, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fuzzy-search-server...");

    let config = Config::from_env().context("Failed to read configuration")?;
    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {}", config.database_path))?;
    let db = Arc::new(db);

    let broker = Arc::new(LocalBroker::new(config.topic_capacity));
    let port = config.port;
    let gc_interval = config.token_gc_interval;
    tracing::info!(
        "Worker pool size {}, heartbeat every {:?}",
        config.worker_pool_size,
        config.heartbeat_interval
    );

    let state = AppState::new(db.clone(), broker.clone() as Arc<dyn Broker>, config);

    let gc = tokio::spawn(cron::start_token_gc_task(
        db,
        gc_interval,
        state.shutdown.child_token(),
    ));

    let app = api::router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("Server error")?;

    state.dispatcher.shutdown().await;
    broker.shutdown();
    if let Err(e) = gc.await {
        tracing::warn!("Token GC task ended abnormally: {}", e);
    }

    Ok(())
}

/// Resolves on Ctrl-C and cancels `shutdown` so open notification streams
/// end before the server stops waiting on their connections.
async fn shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
    shutdown.cancel();
}
