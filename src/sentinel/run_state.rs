//! Run state persistence
//!
//! The settings file is a small JSON object whose `last_run_at` key holds the watermark:
//! the UTC instant (seconds precision) at which the last successful run started listing.
//! Older files spell the key `lastRunAt`; they are read as-is and rewritten with the new
//! key on the next save. Any other keys in the file are carried through untouched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

/// Watermark format used on disk and in Drive's `createdTime` filter.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Error types for run state persistence
#[derive(Error, Debug)]
pub enum RunStateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid watermark {0:?}, expected YYYY-MM-DDTHH:MM:SS")]
    InvalidWatermark(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for run state operations
pub type RunStateResult<T> = Result<T, RunStateError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(alias = "lastRunAt", default)]
    last_run_at: String,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl RunState {
    /// `None` when no run has completed yet, meaning a full scan.
    pub fn watermark(&self) -> Option<&str> {
        let trimmed = self.last_run_at.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn advance_to(&mut self, instant: DateTime<Utc>) {
        self.last_run_at = format_watermark(instant);
    }

    fn validate(&self) -> RunStateResult<()> {
        if let Some(watermark) = self.watermark() {
            NaiveDateTime::parse_from_str(watermark, WATERMARK_FORMAT)
                .map_err(|_| RunStateError::InvalidWatermark(watermark.to_string()))?;
        }
        Ok(())
    }
}

pub fn format_watermark(instant: DateTime<Utc>) -> String {
    instant.format(WATERMARK_FORMAT).to_string()
}

/// Loads and atomically replaces the settings file.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is a first run. A corrupt one is an error, never a silent full scan.
    pub fn load(&self) -> RunStateResult<RunState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings file at {:?}, scanning all files", self.path);
                return Ok(RunState::default());
            }
            Err(source) => {
                return Err(RunStateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let state: RunState =
            serde_json::from_str(&content).map_err(|source| RunStateError::Parse {
                path: self.path.clone(),
                source,
            })?;
        state.validate()?;
        debug!("Loaded watermark {:?}", state.watermark());
        Ok(state)
    }

    /// Write to a temporary file in the same directory, sync, then rename over the old file.
    pub fn save(&self, state: &RunState) -> RunStateResult<()> {
        let io_err = |source| RunStateError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("Saved watermark {:?} to {:?}", state.watermark(), self.path);
        Ok(())
    }
}
