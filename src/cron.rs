use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db::Database;

/// Periodically delete expired and revoked bearer tokens until `shutdown`
/// fires. The first sweep runs immediately.
pub async fn start_token_gc_task(db: Arc<Database>, every: Duration, shutdown: CancellationToken) {
    info!("[GC] Starting token garbage collection every {:?}", every);

    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let db = Arc::clone(&db);
        let result = tokio::task::spawn_blocking(move || db.purge_stale_tokens(Utc::now())).await;

        match result {
            Ok(Ok(0)) => info!("[GC] No stale tokens."),
            Ok(Ok(count)) => info!("[GC] Purged {} stale tokens", count),
            Ok(Err(e)) => error!("[GC] Failed to purge tokens: {}", e),
            Err(e) => error!("[GC] Task panicked: {}", e),
        }
    }

    info!("[GC] Token garbage collection stopped");
}
