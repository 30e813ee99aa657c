//! Checkpoint records and the JSON checkpointer.

use crate::error::{EngineError, Result};
use crate::stage::StageSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Run position and provenance stored alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// The stage plan the run was using when the checkpoint was taken.
    pub stages: Vec<StageSpec>,
    pub epoch: usize,
    pub iter: usize,
    #[serde(default)]
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the serialized model state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Free-form run metadata.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub model_state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_state: Option<serde_json::Value>,
    pub meta: CheckpointMeta,
}

impl CheckpointRecord {
    /// SHA-256 hex digest of the model state.
    pub fn compute_checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.model_state)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Stamp the current model state checksum into the metadata.
    pub fn seal(&mut self) -> Result<()> {
        self.meta.checksum = Some(self.compute_checksum()?);
        Ok(())
    }

    /// Whether the stored checksum matches the model state.
    ///
    /// Records without a checksum are accepted.
    pub fn verify_checksum(&self) -> Result<bool> {
        match &self.meta.checksum {
            Some(expected) => Ok(*expected == self.compute_checksum()?),
            None => Ok(true),
        }
    }
}

/// Where a checkpoint is loaded from.
#[derive(Debug, Clone)]
pub enum CheckpointSource {
    Path(PathBuf),
    Url(String),
    Record(Box<CheckpointRecord>),
}

impl CheckpointSource {
    /// Interpret `s` as a URL if it has an http(s) scheme, else as a path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Self::Url(s.to_string())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }
}

impl From<CheckpointRecord> for CheckpointSource {
    fn from(record: CheckpointRecord) -> Self {
        Self::Record(Box::new(record))
    }
}

impl From<PathBuf> for CheckpointSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for CheckpointSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl std::fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Url(u) => f.write_str(u),
            Self::Record(r) => write!(f, "<record epoch={}>", r.meta.epoch),
        }
    }
}

/// Persists and restores checkpoint records.
pub trait Checkpointer: Send {
    fn load(&self, source: &CheckpointSource) -> Result<CheckpointRecord>;

    /// Persist `record` under `name`, returning its location.
    fn save(&self, record: &CheckpointRecord, name: &str) -> Result<PathBuf>;
}

/// Stores records as pretty-printed JSON files in one directory.
#[derive(Debug, Clone)]
pub struct JsonCheckpointer {
    dir: PathBuf,
}

impl JsonCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name used for the checkpoint written after `epoch` epochs.
    pub fn epoch_name(epoch: usize) -> String {
        format!("epoch_{epoch}")
    }

    /// The `epoch_<n>.json` file in `dir` with the highest `n`.
    pub fn latest(dir: &Path) -> Result<Option<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<(usize, PathBuf)> = None;
        for entry in entries {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("epoch_"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok());
            if let Some(epoch) = epoch {
                if best.as_ref().is_none_or(|(b, _)| epoch > *b) {
                    best = Some((epoch, path));
                }
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    fn read_file(path: &Path) -> Result<CheckpointRecord> {
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::Checkpoint(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Checkpointer for JsonCheckpointer {
    fn load(&self, source: &CheckpointSource) -> Result<CheckpointRecord> {
        debug!(source = %source, "Loading checkpoint");
        match source {
            CheckpointSource::Path(path) if path.is_dir() => {
                let latest = Self::latest(path)?.ok_or_else(|| {
                    EngineError::Checkpoint(format!("no checkpoints in {}", path.display()))
                })?;
                Self::read_file(&latest)
            }
            CheckpointSource::Path(path) => Self::read_file(path),
            CheckpointSource::Url(url) => {
                let record = reqwest::blocking::get(url)?.error_for_status()?.json()?;
                Ok(record)
            }
            CheckpointSource::Record(record) => Ok(record.as_ref().clone()),
        }
    }

    fn save(&self, record: &CheckpointRecord, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let mut record = record.clone();
        record.seal()?;
        let json = serde_json::to_string_pretty(&record)?;

        // Write to a temp file, then rename
        let path = self.dir.join(format!("{name}.json"));
        let temp_path = self.dir.join(format!("{name}.json.tmp"));
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &path)?;

        info!(path = %path.display(), epoch = record.meta.epoch, iter = record.meta.iter, "Saved checkpoint");
        Ok(path)
    }
}
