//! Engine and store configuration, loaded from `stevedore.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::runner::RunnerConfig;
use crate::store::S3Config;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StevedoreConfig {
    pub run: RunConfig,
    pub store: StoreConfig,
    pub engine: EngineSettings,
}

/// Per-run policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    /// `0` means unlimited.
    pub max_concurrency: usize,
    pub fail_fast: bool,
    /// `0` means keep forever.
    pub artifact_retention_days: u64,
    /// Remove the run's artifacts after a successful run.
    pub enable_cleanup: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            fail_fast: true,
            artifact_retention_days: 0,
            enable_cleanup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Local,
    S3,
}

/// Artifact store selection and settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Base directory for the local backend.
    pub base_dir: PathBuf,
    pub s3: S3Config,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            base_dir: PathBuf::from(".stevedore/artifacts"),
            s3: S3Config::default(),
        }
    }
}

/// Engine internals: staging, output budgets, probe cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSettings {
    /// Host directory for per-node artifact staging; a temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub max_output_bytes: usize,
    pub handler_timeout_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            staging_dir: None,
            max_output_bytes: 256 * 1024,
            handler_timeout_seconds: 300,
            poll_interval_ms: 250,
        }
    }
}

impl StevedoreConfig {
    /// Fold into the engine's config struct.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            staging_dir: self
                .engine
                .staging_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("stevedore")),
            handler_timeout: Duration::from_secs(self.engine.handler_timeout_seconds),
            enable_cleanup: self.run.enable_cleanup,
        }
    }

    /// Fold into the container runner's config struct.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_output_bytes: self.engine.max_output_bytes,
            poll_interval: Duration::from_millis(self.engine.poll_interval_ms),
        }
    }
}

/// Load and validate configuration from a TOML file.
///
/// Returns the default config if the file does not exist.
pub fn load_config(path: &Path) -> Result<StevedoreConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(StevedoreConfig::default());
    }

    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("reading config '{}': {e}", path.display())))?;

    parse_config(&data)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(data: &str) -> Result<StevedoreConfig> {
    let config: StevedoreConfig =
        toml::from_str(data).map_err(|e| Error::Validation(format!("parsing config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &StevedoreConfig) -> Result<()> {
    if config.store.backend == StoreBackend::S3 && config.store.s3.bucket.is_empty() {
        return Err(Error::Validation(
            "store.backend is 's3' but store.s3.bucket is empty".into(),
        ));
    }

    if config.engine.max_output_bytes == 0 {
        return Err(Error::Validation(
            "engine.max_output_bytes must be > 0".into(),
        ));
    }

    if config.engine.handler_timeout_seconds == 0 {
        return Err(Error::Validation(
            "engine.handler_timeout_seconds must be > 0".into(),
        ));
    }

    if config.engine.poll_interval_ms == 0 {
        return Err(Error::Validation(
            "engine.poll_interval_ms must be > 0".into(),
        ));
    }

    Ok(())
}
