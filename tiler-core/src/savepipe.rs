//! The Save Pipe: a single-consumer batcher between the Fetcher Pool and
//! the Archive Writer, flushing on a size threshold or when every sender
//! has dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::{Backend, TilePayload};
use crate::error::ArchiveError;
use crate::registry::FailureRegistry;

pub struct SavePipe {
    tx: mpsc::Sender<TilePayload>,
    handle: JoinHandle<Backend>,
}

impl SavePipe {
    /// Spawns the consumer task. `queue_capacity` bounds the in-memory
    /// queue, and therefore producer backpressure, independently of
    /// `batch_size`.
    pub fn spawn(
        batch_size: usize,
        queue_capacity: usize,
        backend: Backend,
        registry: Arc<FailureRegistry>,
        job_id: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(run(rx, batch_size.max(1), backend, registry, job_id));
        SavePipe { tx, handle }
    }

    /// A clone of the queue's sender, handed to the Fetcher Pool.
    pub fn sender(&self) -> mpsc::Sender<TilePayload> {
        self.tx.clone()
    }

    /// Drops this pipe's sender so the consumer observes queue close once
    /// every other clone is also gone, then waits for the final partial
    /// flush and returns the backend connection to the caller.
    pub async fn drain(self) -> Backend {
        drop(self.tx);
        self.handle.await.expect("save pipe consumer task panicked")
    }
}

async fn run(
    mut rx: mpsc::Receiver<TilePayload>,
    batch_size: usize,
    mut backend: Backend,
    registry: Arc<FailureRegistry>,
    job_id: String,
) -> Backend {
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(tile) = rx.recv().await {
        batch.push(tile);
        if batch.len() >= batch_size {
            flush(&mut backend, &registry, &job_id, &mut batch).await;
        }
    }
    if !batch.is_empty() {
        flush(&mut backend, &registry, &job_id, &mut batch).await;
    }
    backend
}

/// Writes one batch, applying a lock-contention reopen-and-retry-once
/// policy. Any failure (including the retry's) fails every tile in the
/// batch out to the Failure Registry; the pipeline continues.
async fn flush(
    backend: &mut Backend,
    registry: &FailureRegistry,
    job_id: &str,
    batch: &mut Vec<TilePayload>,
) {
    match backend.write_batch(batch).await {
        Ok(()) => {}
        Err(ArchiveError::LockContention) => {
            let retry_result = match backend.reopen().await {
                Ok(()) => backend.write_batch(batch).await,
                Err(err) => Err(err),
            };
            if retry_result.is_err() {
                fail_out(registry, job_id, batch).await;
            }
        }
        Err(_) => {
            fail_out(registry, job_id, batch).await;
        }
    }
    batch.clear();
}

async fn fail_out(registry: &FailureRegistry, job_id: &str, batch: &[TilePayload]) {
    for tile in batch {
        if let Err(err) = registry.record(job_id, tile.coord, "batch write failed").await {
            tracing::warn!(%err, job_id, ?tile.coord, "failure registry record failed after batch write failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{BackendConfig, BackendKind, FilesArchive};
    use crate::descriptor::{TileMapDescriptor, TilingScheme};
    use crate::geo::{BoundingBox, TileCoord};
    use deadpool_redis::Config as RedisConfig;

    fn descriptor() -> TileMapDescriptor {
        TileMapDescriptor {
            name: "world".into(),
            description: "".into(),
            attribution: "".into(),
            scheme: TilingScheme::Xyz,
            format: "png".into(),
            bound: BoundingBox { west: -1.0, south: -1.0, east: 1.0, north: 1.0 },
            schema_json: "{}".into(),
            url_template: "https://tiles.example/{z}/{x}/{y}.png".into(),
            minzoom: 0,
            maxzoom: 1,
        }
    }

    fn registry() -> Arc<FailureRegistry> {
        let cfg = RedisConfig::from_url("redis://127.0.0.1:1/0");
        let pool = cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1)).unwrap();
        Arc::new(FailureRegistry::new(pool))
    }

    #[tokio::test]
    async fn flushes_on_batch_size_and_on_drain() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            kind: BackendKind::Files,
            directory: dir.path().to_str().unwrap().to_string(),
            mysql_conn: None,
        };
        let backend = Backend::open(&config, &descriptor(), "world").await.unwrap();

        let pipe = SavePipe::spawn(2, 4, backend, registry(), "job-1".into());
        let tx = pipe.sender();

        for (x, y) in [(0, 0), (1, 0), (0, 1)] {
            tx.send(TilePayload { coord: TileCoord { x, y, z: 1 }, data: vec![1] })
                .await
                .unwrap();
        }
        drop(tx);
        pipe.drain().await;

        for (x, y) in [(0, 0), (1, 0), (0, 1)] {
            let path = dir.path().join(format!("1/{x}/{y}.png"));
            assert!(path.exists(), "missing {path:?}");
        }
    }
}
