use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::TilePayload;
use crate::descriptor::TileMapDescriptor;
use crate::error::ArchiveError;

/// SQLite-backed MBTiles archive. Tuned for write throughput over crash
/// durability: synchronous off, journaling disabled, exclusive locking,
/// enlarged cache.
#[derive(Clone)]
pub struct MbTilesArchive {
    pool: SqlitePool,
    connect_options: SqliteConnectOptions,
}

fn connect_options(path: &str) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Off)
        .synchronous(SqliteSynchronous::Off)
        .locking_mode(sqlx::sqlite::SqliteLockingMode::Exclusive)
        .pragma("cache_size", "8000")
        .pragma("page_size", "4096")
}

impl MbTilesArchive {
    pub async fn open(
        path: &str,
        descriptor: &TileMapDescriptor,
        basename: &str,
    ) -> Result<Self, ArchiveError> {
        let options = connect_options(path);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .map_err(ArchiveError::from_sqlx)?;
        setup_tables(&pool).await?;
        write_metadata(&pool, descriptor, basename).await?;
        Ok(MbTilesArchive { pool, connect_options: options })
    }

    pub async fn write_batch(&self, tiles: &[TilePayload]) -> Result<(), ArchiveError> {
        let mut tx = self.pool.begin().await.map_err(ArchiveError::from_sqlx)?;
        for tile in tiles {
            let tile_row = tile.coord.flip_y();
            sqlx::query(
                "INSERT OR IGNORE INTO tiles (zoom_level, tile_column, tile_row, tile_data) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(tile.coord.z as i64)
            .bind(tile.coord.x as i64)
            .bind(tile_row as i64)
            .bind(&tile.data)
            .execute(&mut *tx)
            .await
            .map_err(ArchiveError::from_sqlx)?;
        }
        tx.commit().await.map_err(ArchiveError::from_sqlx)?;
        Ok(())
    }

    pub async fn reopen(&mut self) -> Result<(), ArchiveError> {
        self.pool.close().await;
        self.pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options.clone())
            .await
            .map_err(ArchiveError::from_sqlx)?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ArchiveError> {
        self.pool.close().await;
        Ok(())
    }

    #[cfg(test)]
    pub async fn row_count(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) AS c FROM tiles")
            .fetch_one(&self.pool)
            .await
            .unwrap()
            .get::<i64, _>("c")
    }
}

async fn setup_tables(pool: &SqlitePool) -> Result<(), ArchiveError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tiles (\
            zoom_level INTEGER, \
            tile_column INTEGER, \
            tile_row INTEGER, \
            tile_data BLOB)",
    )
    .execute(pool)
    .await
    .map_err(ArchiveError::from_sqlx)?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS tiles_index \
         ON tiles (zoom_level, tile_column, tile_row)",
    )
    .execute(pool)
    .await
    .map_err(ArchiveError::from_sqlx)?;

    sqlx::query("CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT)")
        .execute(pool)
        .await
        .map_err(ArchiveError::from_sqlx)?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS metadata_index ON metadata (name)")
        .execute(pool)
        .await
        .map_err(ArchiveError::from_sqlx)?;

    Ok(())
}

async fn write_metadata(
    pool: &SqlitePool,
    descriptor: &TileMapDescriptor,
    basename: &str,
) -> Result<(), ArchiveError> {
    for item in descriptor.meta_items(basename) {
        sqlx::query("INSERT OR IGNORE INTO metadata (name, value) VALUES (?, ?)")
            .bind(item.name)
            .bind(item.value)
            .execute(pool)
            .await
            .map_err(ArchiveError::from_sqlx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TilingScheme;
    use crate::geo::{BoundingBox, TileCoord};

    fn descriptor() -> TileMapDescriptor {
        TileMapDescriptor {
            name: "world".into(),
            description: "test map".into(),
            attribution: "".into(),
            scheme: TilingScheme::Xyz,
            format: "png".into(),
            bound: BoundingBox { west: -1.0, south: -1.0, east: 1.0, north: 1.0 },
            schema_json: "{}".into(),
            url_template: "https://tiles.example/{z}/{x}/{y}.png".into(),
            minzoom: 0,
            maxzoom: 3,
        }
    }

    #[tokio::test]
    async fn write_batch_is_idempotent_on_duplicate_coords() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        let archive = MbTilesArchive::open(path.to_str().unwrap(), &descriptor(), "world")
            .await
            .unwrap();

        let payload = TilePayload { coord: TileCoord { x: 3, y: 4, z: 3 }, data: vec![1, 2, 3] };
        archive.write_batch(&[payload.clone()]).await.unwrap();
        archive.write_batch(&[payload]).await.unwrap();

        assert_eq!(archive.row_count().await, 1);
    }

    #[tokio::test]
    async fn tile_row_is_the_tms_flip_of_xyz_y() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        let archive = MbTilesArchive::open(path.to_str().unwrap(), &descriptor(), "world")
            .await
            .unwrap();

        let coord = TileCoord { x: 3, y: 4, z: 3 };
        archive
            .write_batch(&[TilePayload { coord, data: vec![9] }])
            .await
            .unwrap();

        let row: i64 = sqlx::query("SELECT tile_row FROM tiles LIMIT 1")
            .fetch_one(&archive.pool)
            .await
            .unwrap()
            .get("tile_row");
        assert_eq!(row as u32 + coord.y + 1, 1u32 << coord.z);
    }
}
