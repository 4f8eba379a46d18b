use std::sync::Arc;

use tiler_core::controller::{ControlEvent, EngineConfig, TaskHandle};
use tiler_core::{derive_job_id, new_job, Backend, BackendConfig, FailureRegistry, Job, JobState, TileMapDescriptor};
use tokio::sync::{broadcast, Mutex};

use crate::config::ServerConfig;

/// Shared application state: the Failure Registry pool, the archive and
/// engine configuration a new job is opened with, and the single live job
/// slot. Only one job may run per process; `/start` while a non-terminated
/// job already exists is rejected rather than silently overwriting it.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<FailureRegistry>,
    pub backend_config: BackendConfig,
    pub engine_config: EngineConfig,
    pub default_descriptor: Option<TileMapDescriptor>,
    pub shutdown_tx: broadcast::Sender<()>,
    job: Arc<Mutex<Option<TaskHandle>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("a job is already running")]
    AlreadyRunning,
    #[error("no tile map descriptor configured for this server")]
    NoDescriptor,
    #[error("archive backend setup failed: {0}")]
    BackendOpen(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no job is currently running")]
    NoActiveJob,
    #[error("job control channel closed")]
    ChannelClosed,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        AppState {
            registry: Arc::clone(&config.registry),
            backend_config: config.backend_config.clone(),
            engine_config: config.engine_config,
            default_descriptor: config.descriptor.clone(),
            shutdown_tx,
            job: Arc::new(Mutex::new(None)),
        }
    }

    pub fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Returns `true` if a job is occupying the single-job slot and has not
    /// yet reached `Terminated`.
    async fn has_live_job(&self) -> bool {
        match self.job.lock().await.as_ref() {
            Some(handle) => handle.state() != JobState::Terminated,
            None => false,
        }
    }

    /// Creates and starts a job, resuming from a persisted cursor when
    /// `job_id` is supplied and one exists. Enforces the single-live-job
    /// constraint. Opens the archive backend itself (rather than leaving it
    /// to the spawned controller task) so a setup failure surfaces
    /// synchronously to the `/start` caller.
    pub async fn start_job(&self, job_id: Option<String>) -> Result<String, StartError> {
        if self.has_live_job().await {
            return Err(StartError::AlreadyRunning);
        }
        let descriptor = self.default_descriptor.clone().ok_or(StartError::NoDescriptor)?;

        let id = job_id.unwrap_or_else(|| derive_job_id(&descriptor));
        let backend = Backend::open(&self.backend_config, &descriptor, &id)
            .await
            .map_err(|err| StartError::BackendOpen(err.to_string()))?;

        let job = Job::new(id.clone(), descriptor);
        let (controller, handle) = new_job(job, backend, Arc::clone(&self.registry), self.engine_config);

        *self.job.lock().await = Some(handle);
        tokio::spawn(controller.run());

        Ok(id)
    }

    pub async fn send_control(&self, event: ControlEvent) -> Result<(), ControlError> {
        let guard = self.job.lock().await;
        let handle = guard.as_ref().ok_or(ControlError::NoActiveJob)?;
        handle
            .control_tx
            .send(event)
            .await
            .map_err(|_| ControlError::ChannelClosed)
    }

    pub async fn current_state(&self) -> Option<JobState> {
        self.job.lock().await.as_ref().map(|handle| handle.state())
    }

    /// Aborts any live job. Called from the process shutdown signal handler
    /// so an in-flight job does not end up orphaned when the server exits.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        if self.has_live_job().await {
            let _ = self.send_control(ControlEvent::Abort).await;
        }
    }

    #[cfg(test)]
    pub fn for_test(
        registry: Arc<FailureRegistry>,
        backend_config: BackendConfig,
        descriptor: Option<TileMapDescriptor>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        AppState {
            registry,
            backend_config,
            engine_config: EngineConfig::default(),
            default_descriptor: descriptor,
            shutdown_tx,
            job: Arc::new(Mutex::new(None)),
        }
    }
}
