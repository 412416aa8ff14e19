use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::engine::EngineError;
use crate::model::{now_ms, Ms};
use crate::observability::HOLDS_EXPIRED_TOTAL;

/// Background task that periodically cancels lapsed holds.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(nonzero(every));
    loop {
        interval.tick().await;
        let reaped = reap_expired(&engine, now_ms()).await;
        if reaped > 0 {
            info!(reaped, "expired holds cancelled");
        }
        engine.notify.prune();
    }
}

/// Cancel every hold that lapsed at or before `now`. Returns how many were cancelled.
pub async fn reap_expired(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for (hold_id, resource_id) in engine.collect_expired_holds(now) {
        match engine.expire_hold(hold_id, now).await {
            Ok(true) => {
                metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
                debug!(hold = %hold_id, resource = %resource_id, "hold expired");
                reaped += 1;
            }
            // Confirmed or cancelled since it was collected.
            Ok(false) => {}
            Err(e) => debug!("reaper skip {hold_id}: {e}"),
        }
    }
    reaped
}

/// Background task that rewrites the event log once it has grown by `threshold` events.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(nonzero(every));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("log compaction failed: {e}");
        }
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    if engine.log_appends_since_compact().await < threshold {
        return Ok(false);
    }
    engine.compact_log().await?;
    Ok(true)
}

/// `tokio::time::interval` rejects a zero period.
fn nonzero(every: Duration) -> Duration {
    every.max(Duration::from_millis(1))
}
