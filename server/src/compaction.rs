//! Periodic folding of old deltas.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::AppState;

/// Compact every collection once, folding deltas older than `retention`.
///
/// Returns the number of collections compacted.
pub async fn compact_all(state: &AppState, retention: Duration) -> usize {
    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    let cutoff = now.saturating_sub(retention_ms);

    let mut sync = state.sync.lock().await;
    let mut compacted = 0;
    for collection in sync.collections() {
        let before = sync.persistence().log_len(&collection);
        match sync.compact(&collection, cutoff) {
            Ok(()) => {
                compacted += 1;
                tracing::debug!(
                    collection = %collection,
                    before,
                    after = sync.persistence().log_len(&collection),
                    "Compacted delta log"
                );
            }
            Err(e) => {
                tracing::error!(collection = %collection, "Compaction failed: {}", e);
            }
        }
    }
    compacted
}

/// Run [`compact_all`] every `interval` until the task is aborted.
pub fn spawn(state: AppState, interval: Duration, retention: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let compacted = compact_all(&state, retention).await;
            tracing::info!(collections = compacted, "Periodic compaction finished");
        }
    })
}
