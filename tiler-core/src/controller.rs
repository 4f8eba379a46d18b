//! The Task Controller: the single state machine that drives one job from
//! `Initialize` through `Terminated`, owning every channel the job's tasks
//! communicate over. Job state is published on a `tokio::sync::watch`
//! channel the controller alone sends on, so every reader sees a consistent
//! value with no lock contention against the controller's own cursor
//! writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use crate::archive::Backend;
use crate::descriptor::{Job, JobState, LayerOption, TileMapDescriptor};
use crate::fetcher::{FetchSink, FetcherPool};
use crate::geo;
use crate::registry::FailureRegistry;
use crate::retry;
use crate::savepipe::SavePipe;

/// Events the admin HTTP surface (or any other caller) sends to a running
/// job. The controller is the sole reader of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Pause,
    Resume,
    Abort,
}

/// Tunable engine parameters, distinct from the archive/registry
/// connection parameters in [`crate::config`].
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers: usize,
    pub savepipe_batch: usize,
    pub coords_per_pause: u64,
    pub pause_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: 4,
            savepipe_batch: 8,
            coords_per_pause: 10_000_000,
            pause_duration: Duration::from_secs(120),
        }
    }
}

/// What the admin surface keeps to interact with a running job: a way to
/// send control events, and a lock-free snapshot of the job's state.
pub struct TaskHandle {
    pub job_id: String,
    pub control_tx: mpsc::Sender<ControlEvent>,
    pub state_rx: watch::Receiver<JobState>,
}

impl TaskHandle {
    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }
}

pub struct TaskController {
    job_id: String,
    descriptor: TileMapDescriptor,
    layers: Vec<LayerOption>,
    backend: Backend,
    registry: Arc<FailureRegistry>,
    engine: EngineConfig,
    state_tx: watch::Sender<JobState>,
    control_rx: mpsc::Receiver<ControlEvent>,
}

/// Builds a controller for a fresh or resuming job and the handle its
/// owner (the admin surface) keeps. `backend` must already be open: the
/// caller (the `/start` handler) performs that open itself so an archive
/// setup failure is reported synchronously to the admin surface rather than
/// discovered later on a detached task.
pub fn new_job(
    job: Job,
    backend: Backend,
    registry: Arc<FailureRegistry>,
    engine: EngineConfig,
) -> (TaskController, TaskHandle) {
    let (state_tx, state_rx) = watch::channel(JobState::Initialize);
    let (control_tx, control_rx) = mpsc::channel(8);

    let handle = TaskHandle { job_id: job.id.clone(), control_tx, state_rx };
    let controller = TaskController {
        job_id: job.id,
        descriptor: job.descriptor,
        layers: job.layers,
        backend,
        registry,
        engine,
        state_tx,
        control_rx,
    };
    (controller, handle)
}

impl TaskController {
    /// Runs the job to completion. Consumes `self`; the owner awaits this
    /// as a spawned background task and learns the outcome only through
    /// the `state_rx` watch channel.
    pub async fn run(mut self) {
        let backend = self.backend;

        let resume_cursor = match self.registry.load_cursor(&self.job_id).await {
            Ok(cursor) => cursor,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, %err, "cursor load failed, starting from the beginning");
                None
            }
        };

        let _ = self.state_tx.send(JobState::Running);

        let is_files = matches!(backend, Backend::Files(_));
        let (sink, mut save_pipe, mut direct_backend) = if is_files {
            let files = match &backend {
                Backend::Files(f) => Arc::new(f.clone()),
                _ => unreachable!(),
            };
            (FetchSink::Files(files), None, Some(backend))
        } else {
            let pipe = SavePipe::spawn(
                self.engine.savepipe_batch,
                self.engine.savepipe_batch,
                backend,
                Arc::clone(&self.registry),
                self.job_id.clone(),
            );
            let sink = FetchSink::SavePipe(pipe.sender());
            (sink, Some(pipe), None)
        };

        let pool = Arc::new(FetcherPool::new(
            self.engine.workers,
            Arc::clone(&self.registry),
            self.job_id.clone(),
            self.descriptor.is_vector_format(),
            sink,
        ));

        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let retry_handle = retry::spawn(
            Arc::clone(&pool),
            Arc::clone(&self.registry),
            self.job_id.clone(),
            self.descriptor.url_template.clone(),
            shutdown_tx.subscribe(),
        );
        let progress_counter = Arc::new(AtomicU64::new(0));
        let progress_handle = spawn_progress_logger(
            self.job_id.clone(),
            Arc::clone(&progress_counter),
            shutdown_tx.subscribe(),
        );

        let aborted = self.drive_layers(&resume_cursor, &pool, &progress_counter).await;

        if !aborted {
            let _ = self.state_tx.send(JobState::Ending);
        }

        // Stop the retry loop and drop our own handle to the pool *before*
        // draining the save pipe: the pool holds a `FetchSink::SavePipe`
        // sender clone for as long as it's alive, and the retry loop holds
        // its own `Arc<FetcherPool>` clone for as long as it runs. The save
        // pipe's consumer only exits once every sender clone is gone, so
        // draining first would wait on senders nothing is ever going to drop.
        let _ = shutdown_tx.send(());
        let _ = retry_handle.await;
        drop(pool);

        let final_backend = match save_pipe.take() {
            Some(pipe) => pipe.drain().await,
            None => direct_backend.take().expect("files backend retained when no save pipe was spawned"),
        };

        let _ = progress_handle.await;

        if let Err(err) = final_backend.close().await {
            tracing::warn!(job_id = %self.job_id, %err, "archive close failed");
        }

        let _ = self.state_tx.send(JobState::Terminated);
    }

    /// Runs the ascending-zoom layer loop, applying the resume skip rule
    /// and the pause/resume/abort control surface. Returns `true` if the
    /// job was aborted.
    async fn drive_layers(
        &mut self,
        resume_cursor: &Option<(u8, u32)>,
        pool: &Arc<FetcherPool>,
        progress_counter: &Arc<AtomicU64>,
    ) -> bool {
        for layer in self.layers.clone() {
            let skip_below_x = match resume_cursor {
                Some((cz, _)) if layer.zoom < *cz => continue,
                Some((cz, cx)) if layer.zoom == *cz => Some(cx.saturating_sub(1)),
                _ => None,
            };

            let (coord_tx, mut coord_rx) = mpsc::channel(self.engine.workers * 2);
            let gen_handle = tokio::spawn(geo::generate(layer.bound, layer.zoom, coord_tx));

            let mut last_column: Option<u32> = None;
            let mut emitted_since_pause: u64 = 0;
            let mut aborted = false;

            loop {
                tokio::select! {
                    biased;
                    event = self.control_rx.recv() => {
                        match event {
                            Some(ControlEvent::Abort) | None => {
                                let _ = self.state_tx.send(JobState::Aborting);
                                gen_handle.abort();
                                aborted = true;
                                break;
                            }
                            Some(ControlEvent::Pause) => {
                                let _ = self.state_tx.send(JobState::Pause);
                                if self.wait_out_pause(&gen_handle).await {
                                    aborted = true;
                                    break;
                                }
                            }
                            Some(ControlEvent::Resume) => {}
                        }
                    }
                    coord = coord_rx.recv() => {
                        match coord {
                            None => break,
                            Some(c) => {
                                if let Some(threshold) = skip_below_x {
                                    if c.x < threshold {
                                        continue;
                                    }
                                }
                                if last_column != Some(c.x) {
                                    last_column = Some(c.x);
                                    if let Err(err) = self.registry.save_cursor(&self.job_id, layer.zoom, c.x).await {
                                        tracing::warn!(job_id = %self.job_id, %err, "cursor save failed");
                                    }
                                }

                                pool.submit(c, layer.url_template.clone(), false).await;
                                progress_counter.fetch_add(1, Ordering::Relaxed);

                                emitted_since_pause += 1;
                                if emitted_since_pause >= self.engine.coords_per_pause {
                                    emitted_since_pause = 0;
                                    tracing::info!(job_id = %self.job_id, zoom = layer.zoom, "politeness pause");
                                    tokio::time::sleep(self.engine.pause_duration).await;
                                }
                            }
                        }
                    }
                }
            }

            if aborted {
                return true;
            }
        }
        false
    }

    /// Blocks inside the Pause state until a Resume or Abort event arrives.
    /// Returns `true` if the job was aborted while paused.
    async fn wait_out_pause(&mut self, gen_handle: &tokio::task::JoinHandle<()>) -> bool {
        loop {
            match self.control_rx.recv().await {
                Some(ControlEvent::Resume) => {
                    let _ = self.state_tx.send(JobState::Running);
                    return false;
                }
                Some(ControlEvent::Abort) | None => {
                    let _ = self.state_tx.send(JobState::Aborting);
                    gen_handle.abort();
                    return true;
                }
                Some(ControlEvent::Pause) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Backend, BackendConfig, BackendKind};
    use crate::descriptor::{Job, TileMapDescriptor, TilingScheme};
    use crate::geo::BoundingBox;
    use deadpool_redis::Config as RedisConfig;
    use sqlx::Row;

    /// Nothing listens on this port; cursor load/save failures against it
    /// are logged and otherwise ignored by the controller, so it's safe to
    /// drive a full job against it in these tests.
    fn unreachable_registry() -> Arc<FailureRegistry> {
        let cfg = RedisConfig::from_url("redis://127.0.0.1:1/0");
        let pool = cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1)).unwrap();
        Arc::new(FailureRegistry::new(pool))
    }

    fn small_descriptor(url_template: String) -> TileMapDescriptor {
        TileMapDescriptor {
            name: "world".into(),
            description: "".into(),
            attribution: "".into(),
            scheme: TilingScheme::Xyz,
            format: "png".into(),
            bound: BoundingBox { west: -0.1, south: -0.1, east: 0.1, north: 0.1 },
            schema_json: "{}".into(),
            url_template,
            minzoom: 3,
            maxzoom: 3,
        }
    }

    fn fast_engine() -> EngineConfig {
        EngineConfig { workers: 4, savepipe_batch: 2, coords_per_pause: 10_000_000, pause_duration: Duration::from_secs(120) }
    }

    #[tokio::test]
    async fn a_small_job_runs_to_terminated_and_persists_every_tile() {
        let mut server = mockito::Server::new_async().await;
        for (x, y) in [(3, 3), (3, 4), (4, 3), (4, 4)] {
            server
                .mock("GET", format!("/3/{x}/{y}.png").as_str())
                .with_status(200)
                .with_body("tile-bytes")
                .create_async()
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let url_template = format!("{}/{{z}}/{{x}}/{{y}}.png", server.url());
        let descriptor = small_descriptor(url_template);
        let backend_config = BackendConfig {
            kind: BackendKind::Files,
            directory: dir.path().to_str().unwrap().to_string(),
            mysql_conn: None,
        };
        let backend = Backend::open(&backend_config, &descriptor, "world").await.unwrap();

        let job = Job::new("job-small".into(), descriptor);
        let (controller, handle) = new_job(job, backend, unreachable_registry(), fast_engine());

        let mut state_rx = handle.state_rx.clone();
        let run_handle = tokio::spawn(controller.run());

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *state_rx.borrow() == JobState::Terminated {
                    return;
                }
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("job must reach Terminated");
        run_handle.await.unwrap();

        for (x, y) in [(3, 3), (3, 4), (4, 3), (4, 4)] {
            let path = dir.path().join(format!("3/{x}/{y}.png"));
            assert!(path.exists(), "missing {path:?}");
        }
    }

    #[tokio::test]
    async fn a_mbtiles_job_drains_the_save_pipe_and_reaches_terminated() {
        let mut server = mockito::Server::new_async().await;
        for (x, y) in [(3, 3), (3, 4), (4, 3), (4, 4)] {
            server
                .mock("GET", format!("/3/{x}/{y}.png").as_str())
                .with_status(200)
                .with_body("tile-bytes")
                .create_async()
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let url_template = format!("{}/{{z}}/{{x}}/{{y}}.png", server.url());
        let descriptor = small_descriptor(url_template);
        let backend_config = BackendConfig {
            kind: BackendKind::MbTiles,
            directory: dir.path().to_str().unwrap().to_string(),
            mysql_conn: None,
        };
        let backend = Backend::open(&backend_config, &descriptor, "world").await.unwrap();

        let job = Job::new("job-mbtiles".into(), descriptor);
        let (controller, handle) = new_job(job, backend, unreachable_registry(), fast_engine());

        let mut state_rx = handle.state_rx.clone();
        let run_handle = tokio::spawn(controller.run());

        // This is exactly the path that used to deadlock: the save pipe's
        // consumer only sees its channel close once the pool (and the retry
        // loop's clone of it) are dropped, which must happen before `drain`
        // is awaited inside `run`.
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *state_rx.borrow() == JobState::Terminated {
                    return;
                }
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("mbtiles job must reach Terminated rather than hang in drain");
        run_handle.await.unwrap();

        let path = dir.path().join("world.mbtiles");
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}", path.to_str().unwrap()))
            .await
            .unwrap();
        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM tiles")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get::<i64, _>("c");
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn abort_drains_in_flight_work_and_reaches_terminated() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex(r"^/9/".to_string()))
            .with_status(200)
            .with_body("tile-bytes")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url_template = format!("{}/{{z}}/{{x}}/{{y}}.png", server.url());
        // A much larger box than the S1 one so the abort has time to land
        // before the generator drains on its own.
        let descriptor = TileMapDescriptor {
            bound: BoundingBox { west: -180.0, south: -85.0, east: 180.0, north: 85.0 },
            minzoom: 9,
            maxzoom: 9,
            ..small_descriptor(url_template)
        };
        let backend_config = BackendConfig {
            kind: BackendKind::Files,
            directory: dir.path().to_str().unwrap().to_string(),
            mysql_conn: None,
        };
        let backend = Backend::open(&backend_config, &descriptor, "world").await.unwrap();

        let job = Job::new("job-abort".into(), descriptor);
        let (controller, handle) = new_job(job, backend, unreachable_registry(), fast_engine());

        let mut state_rx = handle.state_rx.clone();
        let run_handle = tokio::spawn(controller.run());
        handle.control_tx.send(ControlEvent::Abort).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *state_rx.borrow() == JobState::Terminated {
                    return;
                }
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("aborted job must still reach Terminated");
        run_handle.await.unwrap();
    }
}

fn spawn_progress_logger(
    job_id: String,
    counter: Arc<AtomicU64>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!(job_id = %job_id, tiles_submitted = counter.load(Ordering::Relaxed), "job progress");
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
