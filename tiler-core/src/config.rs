//! The engine-facing slice of configuration: archive backend selection and
//! the Fetcher Pool / Save Pipe sizing knobs (`app.*`, `output.*`, `task.*`,
//! `tm.*`). `tiler-server` owns loading the file and layering environment
//! overrides on top of these defaults.

use serde::{Deserialize, Serialize};

use crate::archive::{BackendConfig, BackendKind};
use crate::controller::EngineConfig;
use crate::descriptor::{TileMapDescriptor, TilingScheme};
use crate::geo::BoundingBox;

/// `output.*` section: which archive backend a job writes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mbtiles,
    Mysql,
    Files,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Mbtiles
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub directory: String,
    pub conn: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig { format: OutputFormat::default(), directory: "output".into(), conn: None }
    }
}

impl OutputConfig {
    pub fn to_backend_config(&self) -> BackendConfig {
        let kind = match self.format {
            OutputFormat::Mbtiles => BackendKind::MbTiles,
            OutputFormat::Mysql => BackendKind::MySql,
            OutputFormat::Files => BackendKind::Files,
        };
        BackendConfig { kind, directory: self.directory.clone(), mysql_conn: self.conn.clone() }
    }
}

/// `task.*` section: Fetcher Pool and Save Pipe sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub workers: usize,
    pub savepipe: usize,
    pub index: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig { workers: 4, savepipe: 8, index: 0 }
    }
}

impl TaskConfig {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig { workers: self.workers, savepipe_batch: self.savepipe, ..EngineConfig::default() }
    }
}

/// `tm.*` section: the Tile Map Descriptor and zoom range submitted for a
/// job. `bound` deserializes straight from a `{west, east, north, south}`
/// JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileMapConfig {
    pub name: String,
    pub min: u8,
    pub max: u8,
    pub format: String,
    pub schema: String,
    pub bound: BoundingBox,
    pub json: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attribution: String,
}

impl TileMapConfig {
    pub fn to_descriptor(&self) -> TileMapDescriptor {
        TileMapDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            attribution: self.attribution.clone(),
            scheme: parse_scheme(&self.schema),
            format: self.format.clone(),
            bound: self.bound,
            schema_json: self.json.clone(),
            url_template: self.url.clone(),
            minzoom: self.min,
            maxzoom: self.max,
        }
    }
}

/// `tm.schema` is a bare string ("xyz"/"tms") in the config file; anything
/// else falls back to `Xyz` rather than failing config load over a typo.
fn parse_scheme(schema: &str) -> TilingScheme {
    if schema.eq_ignore_ascii_case("tms") {
        TilingScheme::Tms
    } else {
        TilingScheme::Xyz
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: String,
    pub title: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig { version: "v 0.1.0".into(), title: "MapCloud Tiler".into() }
    }
}

/// The full TOML document: the `app`/`output`/`task`/`tm` tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub app: AppConfig,
    pub output: OutputConfig,
    pub task: TaskConfig,
    pub tm: Option<TileMapConfig>,
}

impl Default for RootConfig {
    fn default() -> Self {
        RootConfig {
            app: AppConfig::default(),
            output: OutputConfig::default(),
            task: TaskConfig::default(),
            tm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = RootConfig::default();
        assert_eq!(config.app.version, "v 0.1.0");
        assert_eq!(config.app.title, "MapCloud Tiler");
        assert_eq!(config.output.directory, "output");
        assert!(matches!(config.output.format, OutputFormat::Mbtiles));
        assert_eq!(config.task.workers, 4);
        assert_eq!(config.task.savepipe, 8);
    }

    #[test]
    fn parses_a_full_toml_document() {
        let toml = r#"
            [app]
            title = "Custom Tiler"

            [output]
            format = "files"
            directory = "tiles-out"

            [task]
            workers = 16
            savepipe = 32

            [tm]
            name = "world"
            min = 0
            max = 5
            format = "png"
            schema = "tms"
            json = "{}"
            url = "https://tiles.example/{z}/{x}/{y}.png"

            [tm.bound]
            west = -180.0
            south = -85.0
            east = 180.0
            north = 85.0
        "#;
        let config: RootConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.app.title, "Custom Tiler");
        assert_eq!(config.task.workers, 16);
        let tm = config.tm.unwrap();
        assert_eq!(tm.name, "world");
        assert_eq!(tm.bound.west, -180.0);
    }

    #[test]
    fn to_descriptor_maps_schema_to_scheme_and_json_to_schema_json() {
        let tm = TileMapConfig {
            name: "world".into(),
            min: 0,
            max: 5,
            format: "png".into(),
            schema: "tms".into(),
            bound: BoundingBox { west: -1.0, south: -1.0, east: 1.0, north: 1.0 },
            json: r#"{"vector_layers":[]}"#.into(),
            url: "https://tiles.example/{z}/{x}/{y}.png".into(),
            description: "".into(),
            attribution: "".into(),
        };
        let descriptor = tm.to_descriptor();
        assert_eq!(descriptor.scheme, TilingScheme::Tms);
        assert_eq!(descriptor.schema_json, r#"{"vector_layers":[]}"#);
    }

    #[test]
    fn parse_scheme_falls_back_to_xyz_for_anything_unrecognized() {
        assert_eq!(parse_scheme("xyz"), TilingScheme::Xyz);
        assert_eq!(parse_scheme("XYZ"), TilingScheme::Xyz);
        assert_eq!(parse_scheme("tms"), TilingScheme::Tms);
        assert_eq!(parse_scheme("baselayer"), TilingScheme::Xyz);
    }
}
