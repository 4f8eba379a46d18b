//! The Fetcher Pool: a bounded set of in-flight HTTP fetches, one
//! coordinate per slot, with backpressure as the sole admission control.

use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tokio::sync::{mpsc, Semaphore};

use crate::archive::{FilesArchive, TilePayload};
use crate::geo::TileCoord;
use crate::registry::FailureRegistry;

/// Where a successfully fetched tile goes once it has cleared the pool.
#[derive(Clone)]
pub enum FetchSink {
    /// DB backends: hand off to the Save Pipe's batching queue.
    SavePipe(mpsc::Sender<TilePayload>),
    /// Filesystem backend: no batching layer, write directly.
    Files(Arc<FilesArchive>),
}

/// Bounded HTTP fetch pool. `submit` is the sole admission point; it blocks
/// the caller until a worker slot is free, which is the core backpressure
/// mechanism between the Generator/Retry Loop and the network.
pub struct FetcherPool {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    registry: Arc<FailureRegistry>,
    job_id: String,
    is_vector_format: bool,
    sink: FetchSink,
}

impl FetcherPool {
    pub fn new(
        workers: usize,
        registry: Arc<FailureRegistry>,
        job_id: String,
        is_vector_format: bool,
        sink: FetchSink,
    ) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(workers.max(1))
            .pool_idle_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5 * 60))
            .build()
            .expect("reqwest client configuration is static and always valid");

        FetcherPool {
            client,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            registry,
            job_id,
            is_vector_format,
            sink,
        }
    }

    /// Acquires a slot (blocking the caller if all `W` are in flight), then
    /// spawns the fetch as a detached task. The slot is released when the
    /// permit drops at the end of that task, regardless of outcome.
    pub async fn submit(&self, coord: TileCoord, url_template: String, is_retry: bool) {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("the fetcher pool's semaphore is never closed while a job runs");

        let client = self.client.clone();
        let registry = Arc::clone(&self.registry);
        let job_id = self.job_id.clone();
        let is_vector_format = self.is_vector_format;
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let _permit = permit;
            fetch_one(client, registry, job_id, coord, url_template, is_retry, is_vector_format, sink).await;
        });
    }
}

fn expand_template(template: &str, coord: TileCoord) -> String {
    template
        .replace("{x}", &coord.x.to_string())
        .replace("{y}", &coord.y.to_string())
        .replace("{z}", &coord.z.to_string())
}

async fn fetch_one(
    client: reqwest::Client,
    registry: Arc<FailureRegistry>,
    job_id: String,
    coord: TileCoord,
    url_template: String,
    is_retry: bool,
    is_vector_format: bool,
    sink: FetchSink,
) {
    let url = expand_template(&url_template, coord);

    let response = match client.get(&url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            record(&registry, &job_id, coord, &err.to_string()).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        if status.as_u16() == 404 {
            record(&registry, &job_id, coord, "resp 404").await;
            if is_retry {
                clear(&registry, &job_id, coord).await;
            }
        } else {
            record(&registry, &job_id, coord, &format!("resp {}", status.as_u16())).await;
        }
        return;
    }

    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            record(&registry, &job_id, coord, &err.to_string()).await;
            return;
        }
    };

    if body.is_empty() {
        record(&registry, &job_id, coord, "nil tile").await;
        if is_retry {
            clear(&registry, &job_id, coord).await;
        }
        return;
    }

    let data = if is_vector_format { gzip_wrap(&body) } else { body.to_vec() };
    let payload = TilePayload { coord, data };

    let dispatched = match sink {
        FetchSink::SavePipe(tx) => tx.send(payload).await.is_ok(),
        FetchSink::Files(archive) => archive.write_batch(std::slice::from_ref(&payload)).await.is_ok(),
    };

    if dispatched && is_retry {
        clear(&registry, &job_id, coord).await;
    }
}

fn gzip_wrap(body: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).expect("writing to an in-memory buffer cannot fail");
    encoder.finish().expect("finishing an in-memory gzip stream cannot fail")
}

async fn record(registry: &FailureRegistry, job_id: &str, coord: TileCoord, reason: &str) {
    if let Err(err) = registry.record(job_id, coord, reason).await {
        tracing::warn!(%err, ?coord, job_id, "failure registry record failed");
    }
}

async fn clear(registry: &FailureRegistry, job_id: &str, coord: TileCoord) {
    if let Err(err) = registry.clear(job_id, coord).await {
        tracing::warn!(%err, ?coord, job_id, "failure registry clear failed");
    }
}
