//! Configuration for the `cairn` binary: worker pool sizing, the base URL
//! used to build `location`/`etag` values, and logging, grounded on the
//! teacher's `apps/server/src/config.rs` layered-`Config`/`set_default`
//! pattern. There is no database or HTTP server section here — this harness
//! drives the processor against an in-process store only.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Worker pool width (spec.md §5 default: 20).
    #[serde(default = "default_pool_width")]
    pub pool_width: usize,
    /// Worker pool queue depth (spec.md §5 default: 100).
    #[serde(default = "default_pool_queue_depth")]
    pub pool_queue_depth: usize,
    /// Write timeout before a queued submission is rejected as `Busy`.
    #[serde(default = "default_pool_timeout_seconds")]
    pub pool_timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            pool_width: default_pool_width(),
            pool_queue_depth: default_pool_queue_depth(),
            pool_timeout_seconds: default_pool_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Use JSON formatting for logs (recommended for production).
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/fhir".to_string()
}

fn default_pool_width() -> usize {
    20
}

fn default_pool_queue_depth() -> usize {
    100
}

fn default_pool_timeout_seconds() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load configuration from an optional `cairn.toml`/`cairn.yaml` in the
    /// working directory, then environment variables (`CAIRN__STORE__BASE_URL`
    /// etc.), then built-in defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("store.base_url", default_base_url())?
            .set_default("store.pool_width", default_pool_width() as i64)?
            .set_default("store.pool_queue_depth", default_pool_queue_depth() as i64)?
            .set_default("store.pool_timeout_seconds", default_pool_timeout_seconds())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .add_source(config::File::with_name("cairn").required(false))
            .add_source(
                config::Environment::with_prefix("CAIRN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
