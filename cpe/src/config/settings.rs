//! Settings structs for all descriptor sections.
//!
//! Each struct represents one `[section]` of a CPE descriptor. These are
//! pure data types; parsing lives in [`super::parser`] and conversion into
//! engine types in [`super::assembly`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::container::{ErrorAction, RestartAction};
use crate::deployer::DeploymentKind;

/// A complete CPE descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct CpeDescriptor {
    /// Engine settings
    pub cpe: CpeSettings,
    /// Checkpoint settings
    pub checkpoint: CheckpointSettings,
    /// Collection reader
    pub reader: ReaderSettings,
    /// Pipeline stages in file order
    pub processors: Vec<ProcessorSettings>,
}

/// `[cpe]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CpeSettings {
    pub name: String,
    /// Pipeline threads, honoured only when `parallel` is set
    pub pipelines: usize,
    pub parallel: bool,
    /// CAS pool size; defaults to the number of pipelines
    pub cas_pool_size: Option<usize>,
    pub pause_on_exception: bool,
    /// Entities per listener batch notification (0 = never)
    pub batch_size: u64,
    /// Maximum entities to process (0 = whole collection)
    pub entity_limit: u64,
    /// Initial document buffer per CAS, in bytes
    pub cas_initial_heap_size: usize,
}

/// `[checkpoint]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSettings {
    /// Checkpoint file; checkpointing is disabled when absent
    pub file: Option<PathBuf>,
    /// Completed entities between checkpoints
    pub batch: u64,
}

/// `[reader]` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReaderSettings {
    /// Registry name of the reader
    pub component: String,
    /// Remaining keys, passed to the reader
    pub params: BTreeMap<String, String>,
}

/// One `[processor.<name>]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSettings {
    /// Stage name, taken from the section header
    pub name: String,
    /// Registry name of the processor
    pub component: String,
    pub deployment: DeploymentKind,
    pub pool_size: usize,
    pub max_consecutive_errors: usize,
    pub action_on_max_errors: ErrorAction,
    pub max_restarts: usize,
    pub action_on_max_restarts: RestartAction,
    /// Per-call deadline for fenced stages, in milliseconds
    pub timeout_ms: u64,
    /// Checkout wait bound in milliseconds (0 = wait indefinitely)
    pub checkout_timeout_ms: u64,
    /// Entities per container batch notification (0 = never)
    pub batch_size: usize,
    /// Worker executable for fenced stages; defaults to the running binary
    pub command: Option<PathBuf>,
    /// Worker arguments; default `worker --component <component>`
    pub args: Option<Vec<String>>,
    /// Remaining keys, passed to the processor
    pub params: BTreeMap<String, String>,
}
