//! The Tile Archive Writer: batched, idempotent persistence across the three
//! backend kinds, with a single y-axis-flip rule shared by both DB backends.
//!
//! The backend is selected once at job start into a `Backend` enum rather
//! than dispatched per write on a runtime string, so the hot save path never
//! pays for a string comparison.

mod files;
mod mbtiles;
mod mysql;

pub use files::FilesArchive;
pub use mbtiles::MbTilesArchive;
pub use mysql::MySqlArchive;

use crate::descriptor::TileMapDescriptor;
use crate::error::ArchiveError;
use crate::geo::TileCoord;

/// A fetched tile ready for persistence.
#[derive(Debug, Clone)]
pub struct TilePayload {
    pub coord: TileCoord,
    pub data: Vec<u8>,
}

/// Which archive backend a job was configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    MbTiles,
    MySql,
    Files,
}

/// Parameters needed to open any backend; `mysql_conn` is required only
/// when `kind` is [`BackendKind::MySql`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub directory: String,
    pub mysql_conn: Option<String>,
}

/// The open archive connection for a running job. Selected once at job
/// construction; every `write_batch` call dispatches on the variant instead
/// of comparing backend names.
#[derive(Clone)]
pub enum Backend {
    MbTiles(MbTilesArchive),
    MySql(MySqlArchive),
    Files(FilesArchive),
}

impl Backend {
    pub async fn open(
        config: &BackendConfig,
        descriptor: &TileMapDescriptor,
        basename: &str,
    ) -> Result<Self, ArchiveError> {
        match config.kind {
            BackendKind::MbTiles => {
                let path = format!("{}/{}.mbtiles", config.directory, basename);
                Ok(Backend::MbTiles(MbTilesArchive::open(&path, descriptor, basename).await?))
            }
            BackendKind::MySql => {
                let dsn = config
                    .mysql_conn
                    .as_deref()
                    .ok_or_else(|| ArchiveError::Other(anyhow::anyhow!("output.conn is required for the mysql backend")))?;
                Ok(Backend::MySql(MySqlArchive::open(dsn, descriptor, basename).await?))
            }
            BackendKind::Files => {
                Ok(Backend::Files(FilesArchive::new(config.directory.clone(), descriptor.format.clone())))
            }
        }
    }

    /// Atomically inserts a batch with idempotent (insert-or-ignore)
    /// semantics; a partial failure is never surfaced, only whole-batch
    /// success or a single error.
    pub async fn write_batch(&self, tiles: &[TilePayload]) -> Result<(), ArchiveError> {
        match self {
            Backend::MbTiles(a) => a.write_batch(tiles).await,
            Backend::MySql(a) => a.write_batch(tiles).await,
            Backend::Files(a) => a.write_batch(tiles).await,
        }
    }

    /// Closes and reopens the underlying connection. Called by the Save
    /// Pipe exactly once after a lock-contention error, before retrying the
    /// same batch.
    pub async fn reopen(&mut self) -> Result<(), ArchiveError> {
        match self {
            Backend::MbTiles(a) => a.reopen().await,
            Backend::MySql(a) => a.reopen().await,
            Backend::Files(_) => Ok(()),
        }
    }

    pub async fn close(&self) -> Result<(), ArchiveError> {
        match self {
            Backend::MbTiles(a) => a.close().await,
            Backend::MySql(a) => a.close().await,
            Backend::Files(_) => Ok(()),
        }
    }
}
