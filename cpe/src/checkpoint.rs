//! Run checkpoints.
//!
//! A checkpoint records the reader's [`SynchPoint`] alongside progress and
//! the performance report. Only reader markers are persisted; entities in
//! flight when a checkpoint is written are not.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::engine::{PerformanceReport, Progress, SynchPoint};

/// Default number of completed entities between checkpoints.
pub const DEFAULT_CHECKPOINT_BATCH: u64 = 100;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid checkpoint {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where and how often to checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Completed entities between checkpoints. 0 writes only at the end.
    pub batch: u64,
}

impl CheckpointConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch: DEFAULT_CHECKPOINT_BATCH,
        }
    }

    pub fn with_batch(mut self, batch: u64) -> Self {
        self.batch = batch;
        self
    }
}

/// Contents of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub synch_point: Option<SynchPoint>,
    pub progress: Vec<Progress>,
    pub report: PerformanceReport,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let text = fs::read_to_string(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CheckpointError::Serialize {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Writes checkpoints atomically: temp file, then rename.
#[derive(Debug)]
pub struct CheckpointWriter {
    config: CheckpointConfig,
    lock: Mutex<()>,
}

impl CheckpointWriter {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether `completed` entities is a checkpoint boundary.
    pub fn is_due(&self, completed: u64) -> bool {
        self.config.batch > 0 && completed > 0 && completed % self.config.batch == 0
    }

    pub fn write(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = &self.config.path;
        let json = serde_json::to_string_pretty(checkpoint).map_err(|source| {
            CheckpointError::Serialize {
                path: path.clone(),
                source,
            }
        })?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let _guard = self.lock.lock();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&tmp, json).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "Checkpoint written");
        Ok(())
    }
}
