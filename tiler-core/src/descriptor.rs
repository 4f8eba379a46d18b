//! The Tile Map Descriptor, Layer Option, and Job types shared across the
//! download engine, decoupled from any one archive backend.

use serde::{Deserialize, Serialize};

use crate::geo::{count_tiles, BoundingBox};

/// One entry of the Tile Map Descriptor's metadata table, written once at
/// archive creation.
#[derive(Debug, Clone, Serialize)]
pub struct MetaItem {
    pub name: &'static str,
    pub value: String,
}

/// Tiling scheme a descriptor declares for its source tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingScheme {
    Xyz,
    Tms,
}

impl TilingScheme {
    /// The raw scheme string the metadata `type` row carries, matching the
    /// `tm.schema` value a config file supplies ("xyz" or "tms").
    pub fn as_str(&self) -> &'static str {
        match self {
            TilingScheme::Xyz => "xyz",
            TilingScheme::Tms => "tms",
        }
    }
}

/// Human-facing description of the map being downloaded, feeding the
/// archive's `metadata` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMapDescriptor {
    pub name: String,
    pub description: String,
    pub attribution: String,
    pub scheme: TilingScheme,
    pub format: String,
    pub bound: BoundingBox,
    pub schema_json: String,
    pub url_template: String,
    pub minzoom: u8,
    pub maxzoom: u8,
}

impl TileMapDescriptor {
    /// Returns `true` when tiles under this descriptor must be gzip-wrapped
    /// before persistence (the vector tile format).
    pub fn is_vector_format(&self) -> bool {
        self.format.eq_ignore_ascii_case("pbf")
    }

    fn center(&self) -> (f64, f64, u8) {
        (
            (self.bound.west + self.bound.east) / 2.0,
            (self.bound.south + self.bound.north) / 2.0,
            self.minzoom,
        )
    }

    /// Builds the metadata rows written once at archive creation time, per
    /// the fixed field list (id, name, description, ... json).
    pub fn meta_items(&self, basename: &str) -> Vec<MetaItem> {
        let (cx, cy, cz) = self.center();
        let bounds = format!(
            "{},{},{},{}",
            self.bound.west, self.bound.south, self.bound.east, self.bound.north
        );
        let center = format!("{cx},{cy},{cz}");
        vec![
            MetaItem { name: "id", value: basename.to_string() },
            MetaItem { name: "name", value: self.name.clone() },
            MetaItem { name: "description", value: self.description.clone() },
            MetaItem { name: "attribution", value: self.attribution.clone() },
            MetaItem { name: "basename", value: basename.to_string() },
            MetaItem { name: "format", value: self.format.clone() },
            MetaItem { name: "type", value: self.scheme.as_str().to_string() },
            MetaItem { name: "pixel_scale", value: "256".to_string() },
            MetaItem { name: "version", value: "1.2".to_string() },
            MetaItem { name: "bounds", value: bounds },
            MetaItem { name: "center", value: center },
            MetaItem { name: "minzoom", value: self.minzoom.to_string() },
            MetaItem { name: "maxzoom", value: self.maxzoom.to_string() },
            MetaItem { name: "json", value: self.schema_json.clone() },
        ]
    }
}

/// One zoom level's worth of work: the URL template, the zoom, the box, and
/// the precomputed tile count used for progress totals.
#[derive(Debug, Clone)]
pub struct LayerOption {
    pub url_template: String,
    pub zoom: u8,
    pub bound: BoundingBox,
    pub tile_count: u64,
}

impl LayerOption {
    pub fn new(url_template: String, zoom: u8, bound: BoundingBox) -> Self {
        let tile_count = count_tiles(&bound, zoom);
        LayerOption { url_template, zoom, bound, tile_count }
    }
}

/// Builds the ordered layer sequence for a descriptor's inclusive zoom
/// range, one layer per zoom from `minzoom` to `maxzoom`.
pub fn build_layers(descriptor: &TileMapDescriptor) -> Vec<LayerOption> {
    (descriptor.minzoom..=descriptor.maxzoom)
        .map(|z| LayerOption::new(descriptor.url_template.clone(), z, descriptor.bound))
        .collect()
}

/// The job state machine's single state value, the only thing the
/// controller mutates and every other task reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Initialize,
    Running,
    Pause,
    Ending,
    Aborting,
    Terminated,
}

/// A single download job: identity, descriptor, layer sequence, and current
/// state. The archive backend itself is opened by the [`crate::controller`]
/// from a [`crate::archive::BackendConfig`] rather than carried on the job,
/// since it is a live connection, not job-describing data.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub descriptor: TileMapDescriptor,
    pub layers: Vec<LayerOption>,
    pub state: JobState,
}

impl Job {
    pub fn new(id: String, descriptor: TileMapDescriptor) -> Self {
        let layers = build_layers(&descriptor);
        Job { id, descriptor, layers, state: JobState::Initialize }
    }
}

/// Derives a stable job id from a descriptor when the caller does not
/// supply one explicitly, so repeated `/start` calls against the same map
/// definition land on the same Failure Registry keys.
pub fn derive_job_id(descriptor: &TileMapDescriptor) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(descriptor.name.as_bytes());
    hasher.update(descriptor.url_template.as_bytes());
    hasher.update(&descriptor.minzoom.to_le_bytes());
    hasher.update(&descriptor.maxzoom.to_le_bytes());
    hasher.update(descriptor.bound.west.to_le_bytes().as_slice());
    hasher.update(descriptor.bound.south.to_le_bytes().as_slice());
    hasher.update(descriptor.bound.east.to_le_bytes().as_slice());
    hasher.update(descriptor.bound.north.to_le_bytes().as_slice());
    hasher.finalize().to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TileMapDescriptor {
        TileMapDescriptor {
            name: "world".into(),
            description: "world basemap".into(),
            attribution: "(c) example".into(),
            scheme: TilingScheme::Xyz,
            format: "png".into(),
            bound: BoundingBox { west: -1.0, south: -1.0, east: 1.0, north: 1.0 },
            schema_json: "{}".into(),
            url_template: "https://tiles.example/{z}/{x}/{y}.png".into(),
            minzoom: 0,
            maxzoom: 2,
        }
    }

    #[test]
    fn build_layers_covers_inclusive_zoom_range() {
        let d = descriptor();
        let layers = build_layers(&d);
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0].zoom, 0);
        assert_eq!(layers[2].zoom, 2);
    }

    #[test]
    fn derive_job_id_is_stable() {
        let d = descriptor();
        assert_eq!(derive_job_id(&d), derive_job_id(&d));
    }

    #[test]
    fn meta_items_contains_fixed_field_set() {
        let d = descriptor();
        let items = d.meta_items("world");
        let names: Vec<&str> = items.iter().map(|m| m.name).collect();
        assert_eq!(
            names,
            vec![
                "id", "name", "description", "attribution", "basename", "format", "type",
                "pixel_scale", "version", "bounds", "center", "minzoom", "maxzoom", "json",
            ]
        );
    }
}
