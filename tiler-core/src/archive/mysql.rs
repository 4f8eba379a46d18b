use sqlx::mysql::{MySqlPoolOptions, MySqlQueryResult};
use sqlx::MySqlPool;

use super::TilePayload;
use crate::descriptor::TileMapDescriptor;
use crate::error::ArchiveError;

/// MySQL mirror of the MBTiles schema, used when `output.format = mysql`.
/// Each batch is written as a single multi-row `INSERT IGNORE`.
#[derive(Clone)]
pub struct MySqlArchive {
    pool: MySqlPool,
    dsn: String,
}

impl MySqlArchive {
    pub async fn open(
        dsn: &str,
        descriptor: &TileMapDescriptor,
        basename: &str,
    ) -> Result<Self, ArchiveError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(dsn)
            .await
            .map_err(ArchiveError::from_sqlx)?;
        setup_tables(&pool).await?;
        write_metadata(&pool, descriptor, basename).await?;
        Ok(MySqlArchive { pool, dsn: dsn.to_string() })
    }

    pub async fn write_batch(&self, tiles: &[TilePayload]) -> Result<(), ArchiveError> {
        if tiles.is_empty() {
            return Ok(());
        }
        let mut query = String::from(
            "INSERT IGNORE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES ",
        );
        let placeholders: Vec<&str> = tiles.iter().map(|_| "(?, ?, ?, ?)").collect();
        query.push_str(&placeholders.join(", "));

        let mut stmt = sqlx::query(&query);
        for tile in tiles {
            let tile_row = tile.coord.flip_y();
            stmt = stmt
                .bind(tile.coord.z as i64)
                .bind(tile.coord.x as i64)
                .bind(tile_row as i64)
                .bind(&tile.data);
        }
        let _: MySqlQueryResult = stmt.execute(&self.pool).await.map_err(ArchiveError::from_sqlx)?;
        Ok(())
    }

    pub async fn reopen(&mut self) -> Result<(), ArchiveError> {
        self.pool.close().await;
        self.pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect(&self.dsn)
            .await
            .map_err(ArchiveError::from_sqlx)?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ArchiveError> {
        self.pool.close().await;
        Ok(())
    }
}

async fn setup_tables(pool: &MySqlPool) -> Result<(), ArchiveError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tiles (\
            zoom_level INTEGER, \
            tile_column INTEGER, \
            tile_row INTEGER, \
            tile_data MEDIUMBLOB, \
            UNIQUE KEY tiles_index (zoom_level, tile_column, tile_row))",
    )
    .execute(pool)
    .await
    .map_err(ArchiveError::from_sqlx)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS metadata (\
            name VARCHAR(255), \
            value MEDIUMTEXT, \
            UNIQUE KEY metadata_index (name))",
    )
    .execute(pool)
    .await
    .map_err(ArchiveError::from_sqlx)?;

    Ok(())
}

async fn write_metadata(
    pool: &MySqlPool,
    descriptor: &TileMapDescriptor,
    basename: &str,
) -> Result<(), ArchiveError> {
    for item in descriptor.meta_items(basename) {
        sqlx::query("INSERT IGNORE INTO metadata (name, value) VALUES (?, ?)")
            .bind(item.name)
            .bind(item.value)
            .execute(pool)
            .await
            .map_err(ArchiveError::from_sqlx)?;
    }
    Ok(())
}
