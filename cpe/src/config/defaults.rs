//! Default values for descriptor settings.

use std::collections::BTreeMap;

use super::settings::*;
use crate::cas::DEFAULT_INITIAL_HEAP_SIZE;
use crate::checkpoint::DEFAULT_CHECKPOINT_BATCH;
use crate::container::{
    ErrorAction, RestartAction, DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_MAX_RESTARTS,
    DEFAULT_POOL_SIZE,
};
use crate::deployer::DeploymentKind;
use crate::engine::DEFAULT_ENGINE_NAME;
use crate::transport::DEFAULT_CALL_TIMEOUT;

/// Default pipeline thread count.
pub const DEFAULT_PIPELINES: usize = 1;

/// Default per-call timeout for fenced stages (milliseconds).
pub const DEFAULT_TIMEOUT_MS: u64 = DEFAULT_CALL_TIMEOUT.as_millis() as u64;

impl Default for CpeSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_ENGINE_NAME.to_string(),
            pipelines: DEFAULT_PIPELINES,
            parallel: false,
            cas_pool_size: None,
            pause_on_exception: false,
            batch_size: 0,
            entity_limit: 0,
            cas_initial_heap_size: DEFAULT_INITIAL_HEAP_SIZE,
        }
    }
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            file: None,
            batch: DEFAULT_CHECKPOINT_BATCH,
        }
    }
}

impl ProcessorSettings {
    /// Settings for stage `name` with every other key at its default.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            component: name.clone(),
            name,
            deployment: DeploymentKind::Integrated,
            pool_size: DEFAULT_POOL_SIZE,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            action_on_max_errors: ErrorAction::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            action_on_max_restarts: RestartAction::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            checkout_timeout_ms: 0,
            batch_size: 0,
            command: None,
            args: None,
            params: BTreeMap::new(),
        }
    }
}

impl Default for CpeDescriptor {
    fn default() -> Self {
        Self {
            cpe: CpeSettings::default(),
            checkpoint: CheckpointSettings::default(),
            reader: ReaderSettings::default(),
            processors: Vec::new(),
        }
    }
}
