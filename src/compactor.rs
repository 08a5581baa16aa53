use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::engine::{Engine, EngineError};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact once `threshold` appends have accumulated. Returns whether it ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "WAL compaction not due");
        return Ok(false);
    }
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that keeps the WAL bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}
