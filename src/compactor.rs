use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::Engine;

/// Starts the background compactor with the thresholds from `config`.
pub fn spawn_compactor(engine: Arc<Engine>, config: &Config) -> JoinHandle<()> {
    info!(
        parent: engine.span(),
        threshold = config.compact_threshold,
        interval_ms = config.compact_interval.as_millis() as u64,
        "starting journal compactor"
    );
    tokio::spawn(run_compactor(
        engine,
        config.compact_threshold,
        config.compact_interval,
    ))
}

/// Compacts the journal once at least `threshold` events were appended
/// since the last compaction. Checks every `every`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns the number of snapshot events written, or
/// `None` when nothing was done.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appended = engine.journal_appends_since_compact().await;
    if appended < threshold.max(1) {
        return None;
    }
    match engine.compact_journal().await {
        Ok(written) => {
            debug!(parent: engine.span(), appended, written, "compactor pass");
            Some(written)
        }
        Err(e) => {
            warn!(parent: engine.span(), error = %e, "compactor pass failed");
            None
        }
    }
}
