//! `tiler_core`: the download engine behind the tile downloader — tile
//! coordinate math, the Failure Registry, the Tile Archive Writer, the
//! Fetcher Pool, the Save Pipe, the Retry Loop, and the Task Controller
//! that wires them together into one resumable job.
//!
//! `tiler-server` is the thin HTTP shell around this crate; everything a
//! job needs to run lives here so the engine can be driven from a test
//! harness without any network surface at all.

pub mod archive;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod fetcher;
pub mod geo;
pub mod registry;
pub mod retry;
pub mod savepipe;

pub use archive::{Backend, BackendConfig, BackendKind, TilePayload};
pub use controller::{new_job, ControlEvent, EngineConfig, TaskController, TaskHandle};
pub use descriptor::{derive_job_id, Job, JobState, LayerOption, MetaItem, TileMapDescriptor, TilingScheme};
pub use error::{ArchiveError, RegistryError};
pub use geo::{BoundingBox, TileCoord};
pub use registry::{FailureRecord, FailureRegistry};
