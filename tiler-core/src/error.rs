use thiserror::Error;

/// Errors surfaced by the [`crate::archive`] backends.
///
/// `LockContention` is split out from `Other` because the Save Pipe treats
/// it specially: a lock-contention failure gets one reopen-and-retry of the
/// same batch, while any other failure goes straight to the fail list.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("database is locked")]
    LockContention,
    #[error("archive backend error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ArchiveError {
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_contention(&err) {
            ArchiveError::LockContention
        } else {
            ArchiveError::Other(err.into())
        }
    }
}

fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Errors surfaced by [`crate::registry::FailureRegistry`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry connection error: {0}")]
    Connection(#[from] deadpool_redis::PoolError),
    #[error("registry command error: {0}")]
    Command(#[from] deadpool_redis::redis::RedisError),
    #[error("registry record serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
