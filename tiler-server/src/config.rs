//! Process-level configuration: the TOML file named by `-c`/`--config`
//! (defaulting to `config.toml`), layered with `TILER_`-prefixed
//! environment variable overrides, producing everything [`crate::state::AppState`]
//! needs to open jobs.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tiler_core::config::RootConfig;
use tiler_core::{BackendConfig, EngineConfig, FailureRegistry, TileMapDescriptor};

#[derive(Debug, Parser)]
#[command(name = "tiler-server", version, about = "Resumable HTTP map tile downloader")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "config.toml")]
    pub config: String,
}

/// Everything the admin HTTP surface needs: where to listen, the Failure
/// Registry pool, and the archive/engine/descriptor configuration a new job
/// is opened with.
pub struct ServerConfig {
    pub admin_addr: String,
    pub registry: Arc<FailureRegistry>,
    pub backend_config: BackendConfig,
    pub engine_config: EngineConfig,
    pub descriptor: Option<TileMapDescriptor>,
    pub log_file: String,
    pub app_title: String,
}

impl ServerConfig {
    /// A missing or unparseable config file is a warning, not a startup
    /// failure — the server falls back to `RootConfig::default()` and only
    /// `/start` fails later if no `[tm]` section (URL template / bounding
    /// box) was ever supplied.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&RootConfig::default())?);

        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            tracing::warn!(path, "config file not found, continuing with defaults");
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("TILER").separator("__"))
            .build();

        let root: RootConfig = match settings.and_then(|s| s.try_deserialize()) {
            Ok(root) => root,
            Err(err) => {
                tracing::warn!(%err, path, "config file could not be parsed, continuing with defaults");
                RootConfig::default()
            }
        };

        let descriptor = root.tm.as_ref().map(|tm| tm.to_descriptor());
        if descriptor.is_none() {
            tracing::warn!("no [tm] section configured; /start will fail until one is provided");
        }

        let registry_url = std::env::var("TILER_REGISTRY_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis_config = deadpool_redis::Config::from_url(&registry_url);
        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|err| anyhow::anyhow!("failed to build failure-registry pool for {registry_url}: {err}"))?;

        let admin_addr =
            std::env::var("TILER_ADMIN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        Ok(ServerConfig {
            admin_addr,
            registry: Arc::new(FailureRegistry::new(pool)),
            backend_config: root.output.to_backend_config(),
            engine_config: root.task.to_engine_config(),
            descriptor,
            log_file: "download.log".to_string(),
            app_title: root.app.title,
        })
    }
}
