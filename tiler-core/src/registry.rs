//! The Failure Registry: a Redis-backed key/value store holding each job's
//! `fail_list`, `nil_list`, and progress cursor, built on a pooled
//! `deadpool-redis` client acquired and released per call.

use std::collections::HashMap;

use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::geo::TileCoord;

/// A decoded failure-list entry: the coordinate plus the reason string that
/// caused the fetch to fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
    pub res: String,
}

impl FailureRecord {
    fn field_key(&self) -> String {
        field_key(self.x, self.y, self.z)
    }
}

fn field_key(x: u32, y: u32, z: u8) -> String {
    format!("tile_{x}_{y}_{z}")
}

/// `nil tile` and 404 responses are permanent: they go to `nil_list` and are
/// never retried. Everything else lands in `fail_list`.
fn is_permanent(reason: &str) -> bool {
    reason == "nil tile" || reason == "resp 404"
}

pub struct FailureRegistry {
    pool: Pool,
}

impl FailureRegistry {
    pub fn new(pool: Pool) -> Self {
        FailureRegistry { pool }
    }

    /// Records a failed coordinate into `fail_list:<jobId>` or
    /// `nil_list:<jobId>` depending on the reason, keyed by
    /// `tile_<x>_<y>_<z>`.
    pub async fn record(
        &self,
        job_id: &str,
        coord: TileCoord,
        reason: &str,
    ) -> Result<(), RegistryError> {
        let record = FailureRecord { x: coord.x, y: coord.y, z: coord.z, res: reason.to_string() };
        let payload = serde_json::to_string(&record)?;
        let list = if is_permanent(reason) { "nil_list" } else { "fail_list" };
        let mut conn = self.pool.get().await?;
        let _: () = conn.hset(format!("{list}:{job_id}"), record.field_key(), payload).await?;
        Ok(())
    }

    /// Removes a coordinate's entry from `fail_list:<jobId>`, used after a
    /// successful retry or a permanent-failure observation during retry.
    pub async fn clear(&self, job_id: &str, coord: TileCoord) -> Result<(), RegistryError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .hdel(format!("fail_list:{job_id}"), field_key(coord.x, coord.y, coord.z))
            .await?;
        Ok(())
    }

    /// Returns every entry currently in `fail_list:<jobId>`, decoded.
    pub async fn snapshot(&self, job_id: &str) -> Result<HashMap<String, FailureRecord>, RegistryError> {
        let mut conn = self.pool.get().await?;
        let raw: HashMap<String, String> = conn.hgetall(format!("fail_list:{job_id}")).await?;
        let mut decoded = HashMap::with_capacity(raw.len());
        for (field, value) in raw {
            let record: FailureRecord = serde_json::from_str(&value)?;
            decoded.insert(field, record);
        }
        Ok(decoded)
    }

    /// Deletes `cursor:<jobId>`, `fail_list:<jobId>`, and `nil_list:<jobId>`
    /// for a clean restart.
    pub async fn reset(&self, job_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn
            .del(&[
                format!("cursor:{job_id}"),
                format!("fail_list:{job_id}"),
                format!("nil_list:{job_id}"),
            ])
            .await?;
        Ok(())
    }

    /// Loads the persisted `(zoom, x)` cursor, if any.
    pub async fn load_cursor(&self, job_id: &str) -> Result<Option<(u8, u32)>, RegistryError> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(format!("cursor:{job_id}")).await?;
        Ok(raw.and_then(|s| parse_cursor(&s)))
    }

    /// Persists the `(zoom, x)` cursor as `"<z>:<x>"`.
    pub async fn save_cursor(&self, job_id: &str, z: u8, x: u32) -> Result<(), RegistryError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(format!("cursor:{job_id}"), format!("{z}:{x}")).await?;
        Ok(())
    }
}

fn parse_cursor(raw: &str) -> Option<(u8, u32)> {
    let (z, x) = raw.split_once(':')?;
    Some((z.parse().ok()?, x.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_reasons_route_to_nil_list() {
        assert!(is_permanent("nil tile"));
        assert!(is_permanent("resp 404"));
        assert!(!is_permanent("resp 500"));
        assert!(!is_permanent("error sending request"));
    }

    #[test]
    fn cursor_round_trips_through_the_wire_format() {
        assert_eq!(parse_cursor("5:1024"), Some((5, 1024)));
        assert_eq!(parse_cursor("garbage"), None);
        assert_eq!(parse_cursor(""), None);
    }

    #[test]
    fn field_key_matches_wire_contract() {
        assert_eq!(field_key(3, 4, 5), "tile_3_4_5");
    }
}
