use tokio::fs;

use super::TilePayload;
use crate::error::ArchiveError;

/// Filesystem archive backend: `<rootdir>/<z>/<x>/<y>.<format>`, preserving
/// the XYZ `y` (no TMS flip).
#[derive(Clone)]
pub struct FilesArchive {
    root: String,
    format: String,
}

impl FilesArchive {
    pub fn new(root: String, format: String) -> Self {
        FilesArchive { root, format }
    }

    pub async fn write_batch(&self, tiles: &[TilePayload]) -> Result<(), ArchiveError> {
        for tile in tiles {
            let dir = format!("{}/{}/{}", self.root, tile.coord.z, tile.coord.x);
            fs::create_dir_all(&dir).await.map_err(|e| ArchiveError::Other(e.into()))?;
            let path = format!("{dir}/{}.{}", tile.coord.y, self.format);
            fs::write(path, &tile.data).await.map_err(|e| ArchiveError::Other(e.into()))?;
        }
        Ok(())
    }
}
