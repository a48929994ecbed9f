//! Periodic removal of old task records.
//!
//! Runs on a fixed interval using `tokio::time::interval` and deletes
//! every record created more than the retention period ago, whatever its
//! status.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::TaskStore;

/// Run the retention sweep loop until `cancel` is triggered.
pub async fn run(
    store: Arc<dyn TaskStore>,
    retention: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = every.as_secs(),
        "Task retention sweeper started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Task retention sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                match store.sweep_older_than(retention).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Task retention: purged old tasks");
                    }
                    Ok(_) => {
                        tracing::debug!("Task retention: nothing to purge");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Task retention: sweep failed");
                    }
                }
            }
        }
    }
}
