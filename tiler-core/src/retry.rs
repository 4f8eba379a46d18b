//! The Retry Loop: a periodic background scan of the Failure Registry's
//! `fail_list`, resubmitting entries through the Fetcher Pool every five
//! seconds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::fetcher::FetcherPool;
use crate::geo::TileCoord;
use crate::registry::FailureRegistry;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Spawns the retry loop. It runs until `shutdown` fires, which the
/// controller does once the job reaches `Terminated`. No deduplication
/// beyond the registry's own hash semantics; a coordinate resubmitted twice
/// across intervals is tolerated by the archive's idempotent insert.
pub fn spawn(
    pool: Arc<FetcherPool>,
    registry: Arc<FailureRegistry>,
    job_id: String,
    url_template: String,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scan_and_resubmit(&pool, &registry, &job_id, &url_template).await;
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

async fn scan_and_resubmit(
    pool: &FetcherPool,
    registry: &FailureRegistry,
    job_id: &str,
    url_template: &str,
) {
    let entries = match registry.snapshot(job_id).await {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(%err, job_id, "retry loop snapshot failed");
            return;
        }
    };

    for record in entries.into_values() {
        let coord = TileCoord { x: record.x, y: record.y, z: record.z };
        pool.submit(coord, url_template.to_string(), true).await;
    }
}
