//! Error taxonomy for the collection processing engine.
//!
//! Errors are split by the phase in which they can occur:
//!
//! - [`ConfigurationError`]: detected while assembling an engine, never during a run
//! - [`DeploymentError`]: a stage instance could not be launched, connected or checked out
//! - [`ProcessingError`]: one stage failed one entity; resolved by the container's fault policy
//! - [`ReaderError`]: the collection reader failed; always fatal for the run
//! - [`FatalError`]: the reason a run was aborted
//! - [`EngineError`]: what the [`CpmEngine`](crate::engine::CpmEngine) facade returns
//!
//! Transport failures live next to the socket code as
//! [`TransportError`](crate::transport::TransportError).

use std::time::Duration;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::engine::RunState;
use crate::transport::{Endpoint, TransportError};

/// Errors raised while validating or assembling an engine.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A pool was declared with zero instances.
    #[error("Invalid pool size for '{consumer}': {size} (must be at least 1)")]
    InvalidPoolSize { consumer: String, size: usize },

    /// No CAS pool exists for the requested consumer.
    #[error("No CAS pool defined for consumer '{0}'")]
    UnknownConsumer(String),

    /// A CAS pool was defined twice for the same consumer.
    #[error("CAS pool already defined for consumer '{0}'")]
    DuplicateConsumer(String),

    /// Two components declare the same type incompatibly.
    #[error("Incompatible definitions of type '{type_name}': {reason}")]
    TypeConflict { type_name: String, reason: String },

    /// Two components declare the same index label incompatibly.
    #[error("Incompatible definitions of index '{label}': {reason}")]
    IndexConflict { label: String, reason: String },

    /// Two components declare contradicting type priorities.
    #[error("Contradicting type priorities: '{first}' and '{second}' ordered both ways")]
    PriorityConflict { first: String, second: String },

    /// Metadata arrived after the CAS pools were allocated.
    #[error("Type system metadata cannot be added after CAS pools are defined")]
    MetadataSealed,

    /// A component name is not registered.
    #[error("Unknown component '{0}'")]
    UnknownComponent(String),

    /// Two stages share a name.
    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),

    /// The engine was built without a collection reader.
    #[error("No collection reader configured")]
    MissingReader,

    /// Any other invalid setting.
    #[error("Invalid configuration for '{component}': {reason}")]
    Invalid { component: String, reason: String },
}

impl ConfigurationError {
    /// Convenience constructor for [`ConfigurationError::Invalid`].
    pub fn invalid(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while launching, connecting or checking out stage instances.
#[derive(Debug, Error)]
pub enum DeploymentError {
    /// A worker process or in-process instance could not be created.
    #[error("Failed to launch '{stage}': {reason}")]
    Launch { stage: String, reason: String },

    /// A fenced worker was launched but the proxy could not reach it.
    #[error("Failed to connect to fenced worker for '{stage}': {source}")]
    Connect {
        stage: String,
        #[source]
        source: TransportError,
    },

    /// No instance became free within the configured checkout timeout.
    #[error("Timed out after {timeout:?} waiting for an instance of '{container}'")]
    CheckoutTimeout { container: String, timeout: Duration },

    /// The process controller returned the wrong number of endpoints.
    #[error("Process controller returned {actual} endpoints for '{stage}', expected {expected}")]
    EndpointCountMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    /// An endpoint was undeployed that the controller does not know about.
    #[error("Endpoint {0} is not managed by this controller")]
    UnknownEndpoint(Endpoint),

    /// The container has been shut down.
    #[error("Container '{0}' is shut down")]
    Closed(String),
}

/// A stage failed to process one entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{component}: {message}")]
pub struct ProcessingError {
    /// Stage or component that raised the error.
    pub component: String,
    /// Human-readable cause.
    pub message: String,
}

impl ProcessingError {
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a collection reader.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("I/O error reading collection: {0}")]
    Io(#[from] std::io::Error),

    #[error("Collection reader failed: {0}")]
    Failed(String),

    #[error("Invalid synch point: {0}")]
    InvalidSynchPoint(String),

    #[error("Reader does not support resuming from a synch point")]
    RestoreUnsupported,
}

/// Reason an entire run was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("Collection reader failed: {0}")]
    Reader(String),

    #[error("Stage '{container}' terminated the run: {reason}")]
    StageTerminated { container: String, reason: String },

    #[error("Stage '{container}' could not be deployed: {reason}")]
    Deployment { container: String, reason: String },

    #[error("CAS pool unavailable: {0}")]
    CasPool(String),

    #[error("Engine setup failed: {0}")]
    Setup(String),

    #[error("Pipeline thread panicked")]
    PipelinePanicked,
}

/// Errors returned by the engine facade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `process()` was called while the engine was not idle.
    #[error("Engine is not idle (state: {state})")]
    AlreadyRunning { state: RunState },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Failed to spawn thread: {0}")]
    Spawn(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_display() {
        let err = ProcessingError::new("tokenizer", "bad input");
        assert_eq!(err.to_string(), "tokenizer: bad input");
    }

    #[test]
    fn test_already_running_display() {
        let err = EngineError::AlreadyRunning {
            state: RunState::Running,
        };
        assert_eq!(err.to_string(), "Engine is not idle (state: Running)");
    }

    #[test]
    fn test_configuration_error_converts_into_engine_error() {
        let err: EngineError = ConfigurationError::MissingReader.into();
        assert!(matches!(
            err,
            EngineError::Configuration(ConfigurationError::MissingReader)
        ));
    }
}
