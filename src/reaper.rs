use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::kv::InMemoryKv;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Drop expired KV entries once; returns how many went.
pub fn sweep_kv(kv: &InMemoryKv) -> usize {
    let purged = kv.purge_expired();
    if purged > 0 {
        metrics::counter!(crate::observability::KV_PURGED_TOTAL).increment(purged as u64);
        debug!("purged {purged} expired kv entries");
    }
    purged
}

/// Background task that periodically removes expired throttle keys.
pub async fn run_kv_sweeper(kv: Arc<InMemoryKv>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        sweep_kv(&kv);
    }
}

/// Compact the WAL if at least `threshold` events were appended since the
/// last compaction. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appended} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that compacts the WAL once it grows past `threshold`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
