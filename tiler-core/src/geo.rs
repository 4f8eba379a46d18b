//! Bounding-box and Web-Mercator tile-coordinate math, generalized to
//! handle antimeridian-crossing boxes and multi-zoom layers.

use std::f64::consts::PI;

use tokio::sync::mpsc;

/// Web-Mercator projection is undefined past this latitude.
pub const WEB_MERCATOR_LAT_LIMIT: f64 = 85.05112877980659;

/// An axis-aligned geographic bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    /// Splits a box that wraps the antimeridian (`west > east`) into two
    /// ordinary boxes either side of +/-180 degrees. Non-wrapping boxes are
    /// returned unchanged as a single-element vector.
    pub fn split_antimeridian(&self) -> Vec<BoundingBox> {
        if self.west > self.east {
            vec![
                BoundingBox {
                    west: -180.0,
                    south: self.south,
                    east: self.east,
                    north: self.north,
                },
                BoundingBox {
                    west: self.west,
                    south: self.south,
                    east: 180.0,
                    north: self.north,
                },
            ]
        } else {
            vec![*self]
        }
    }

    /// Clamps longitudes to +/-180 and latitudes to the Web-Mercator limit.
    pub fn clamp_mercator(&self) -> BoundingBox {
        BoundingBox {
            west: self.west.max(-180.0),
            south: self.south.max(-WEB_MERCATOR_LAT_LIMIT),
            east: self.east.min(180.0),
            north: self.north.min(WEB_MERCATOR_LAT_LIMIT),
        }
    }
}

/// A single Web-Mercator tile coordinate in XYZ convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileCoord {
    /// TMS row for this XYZ coordinate: `(1 << z) - y - 1`.
    pub fn flip_y(&self) -> u32 {
        (1u32 << self.z) - self.y - 1
    }
}

/// Converts a (lng, lat) corner to tile indices at `z`, per the standard
/// Web-Mercator slippy-map formula. Indices may be negative or >= 2^z; the
/// caller is responsible for clamping to the valid tile range.
fn lonlat_to_tile_index(lng_deg: f64, lat_deg: f64, z: u8) -> (i64, i64) {
    let lat_rad = lat_deg.to_radians();
    let n = 2f64.powi(z as i32);
    let x = ((lng_deg + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();
    (x as i64, y as i64)
}

/// Range of tile indices `(x_start, x_end_exclusive, y_start, y_end_exclusive)`
/// covering one (already antimeridian-split) box at zoom `z`.
fn tile_range(bbox: &BoundingBox, z: u8) -> (i64, i64, i64, i64) {
    let n: i64 = 1i64 << z;
    let clamped = bbox.clamp_mercator();
    let (llx, lly) = lonlat_to_tile_index(clamped.west, clamped.south, z);
    let (urx, ury) = lonlat_to_tile_index(clamped.east, clamped.north, z);
    let x_start = llx.max(0);
    let x_end = (urx + 1).min(n);
    let y_start = ury.max(0);
    let y_end = (lly + 1).min(n);
    (x_start, x_end, y_start, y_end)
}

/// Pure count of tiles a box covers at `z`, matching [`generate`] exactly.
/// Used at job construction time to size progress totals without paying
/// for a full enumeration.
pub fn count_tiles(bbox: &BoundingBox, z: u8) -> u64 {
    bbox.split_antimeridian()
        .iter()
        .map(|b| {
            let (x_start, x_end, y_start, y_end) = tile_range(b, z);
            if x_end > x_start && y_end > y_start {
                (x_end - x_start) as u64 * (y_end - y_start) as u64
            } else {
                0
            }
        })
        .sum()
}

/// Streams every tile coordinate covering `bbox` at `z` onto `tx`, in
/// (x major, y minor) order within each antimeridian-split half, then
/// drops the sender so the channel closes.
///
/// If the receiver is dropped early the send simply returns an error and
/// the loop breaks; no resources beyond the already-allocated stack frame
/// are held, so an abandoned consumer cannot leak anything here.
pub async fn generate(bbox: BoundingBox, z: u8, tx: mpsc::Sender<TileCoord>) {
    for b in bbox.split_antimeridian() {
        let (x_start, x_end, y_start, y_end) = tile_range(&b, z);
        for x in x_start..x_end {
            for y in y_start..y_end {
                let coord = TileCoord {
                    x: x as u32,
                    y: y as u32,
                    z,
                };
                if tx.send(coord).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_box_single_zoom_s1() {
        let bbox = BoundingBox {
            west: -0.1,
            south: -0.1,
            east: 0.1,
            north: 0.1,
        };
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(generate(bbox, 3, tx));
        let mut coords = Vec::new();
        while let Some(c) = rx.recv().await {
            coords.push((c.z, c.x, c.y));
        }
        coords.sort();
        let mut expected = vec![(3, 3, 4), (3, 4, 4), (3, 3, 3), (3, 4, 3)];
        expected.sort();
        assert_eq!(coords, expected);
        assert_eq!(count_tiles(&bbox, 3), 4);
    }

    #[tokio::test]
    async fn antimeridian_wrap_s2() {
        let bbox = BoundingBox {
            west: 170.0,
            south: -10.0,
            east: -170.0,
            north: 10.0,
        };
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(generate(bbox, 2, tx));
        let mut coords = Vec::new();
        while let Some(c) = rx.recv().await {
            coords.push((c.z, c.x, c.y));
        }
        coords.sort();
        let mut expected = vec![(2, 0, 1), (2, 0, 2), (2, 3, 1), (2, 3, 2)];
        expected.sort();
        assert_eq!(coords, expected);
        assert_eq!(count_tiles(&bbox, 2), 4);
    }

    #[tokio::test]
    async fn abandoned_receiver_does_not_hang() {
        let bbox = BoundingBox {
            west: -180.0,
            south: -85.0,
            east: 180.0,
            north: 85.0,
        };
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(generate(bbox, 10, tx));
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("generator must stop promptly once receiver is dropped")
            .unwrap();
    }

    #[test]
    fn flip_y_round_trip() {
        let c = TileCoord { x: 3, y: 4, z: 3 };
        let row = c.flip_y();
        assert_eq!(row + c.y + 1, 1u32 << c.z);
    }
}
