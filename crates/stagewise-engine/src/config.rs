//! Run configuration.
//!
//! A run is described by a single file (TOML, JSON or YAML) that can be
//! overridden from the environment, e.g. `STAGEWISE__SEED=7` or
//! `STAGEWISE__WORK_DIR=/tmp/run`.

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::error::{EngineError, Result};
use crate::hooks::HookSpec;
use crate::stage::{ComponentSpec, StageSpec};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Seed used when the configuration does not set one.
pub const DEFAULT_SEED: u64 = 42;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STAGEWISE";

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

/// Data sources by mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub train: ComponentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<ComponentSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<ComponentSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<StageSpec>),
    One(Box<StageSpec>),
}

/// A single stage table is read as a one-stage schedule.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<StageSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(stages) => stages,
        OneOrMany::One(stage) => vec![*stage],
    })
}

/// Everything needed to build and launch an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: ComponentSpec,
    pub data: DataConfig,
    #[serde(deserialize_with = "one_or_many")]
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    /// Values retained per buffer key.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Filter directive for the log subscriber, e.g. `info` or `stagewise_engine=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Free-form values copied into every checkpoint.
    #[serde(default)]
    pub meta: serde_json::Map<String, serde_json::Value>,
    /// Checkpoint path or URL to resume from before launching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<String>,
}

impl EngineConfig {
    /// Load a configuration file and apply `STAGEWISE__*` environment overrides.
    ///
    /// The file format follows the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| EngineError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.model.kind.trim().is_empty() {
            return Err(EngineError::configuration("model type is required"));
        }
        if self.data.train.kind.trim().is_empty() {
            return Err(EngineError::configuration("train data type is required"));
        }
        if self.stages.is_empty() {
            return Err(EngineError::configuration("at least one stage is required"));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            stage.validate(i)?;
        }
        for hook in &self.hooks {
            hook.validate()?;
        }
        if self.buffer_size == 0 {
            return Err(EngineError::configuration("buffer_size must be >= 1"));
        }
        Ok(())
    }
}
