//! Stage instances.
//!
//! A pipeline stage is implemented by a [`CasProcessor`]. The engine holds
//! each pooled instance as a [`StageInstance`], which is either the processor
//! itself (integrated) or a [`FencedProxy`] forwarding calls to a worker
//! process. Both variants share one call contract.

mod fenced;

pub use fenced::FencedProxy;

use std::sync::Arc;
use thiserror::Error;

use crate::cas::{Cas, ProcessingResourceMetaData};
use crate::error::ProcessingError;
use crate::transport::{CallInterrupter, TransportError};

/// An analysis stage.
///
/// Implementations are used by one thread at a time; the pool guarantees
/// exclusive ownership between checkout and checkin.
pub trait CasProcessor: Send {
    /// Processes one CAS in place.
    fn process(&mut self, cas: &mut Cas) -> Result<(), ProcessingError>;

    /// Whether the instance keeps no state between calls.
    fn is_stateless(&self) -> bool {
        true
    }

    /// Type system and identity of this component.
    fn metadata(&self) -> ProcessingResourceMetaData;

    /// Called on the instance that completes a container batch.
    fn batch_process_complete(&mut self) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Called on every instance once the whole collection has been processed.
    fn collection_process_complete(&mut self) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Creates fresh integrated instances of one stage.
pub type ProcessorFactory =
    Arc<dyn Fn() -> Result<Box<dyn CasProcessor>, ProcessingError> + Send + Sync>;

/// Failure of one call into a stage instance.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl InvocationError {
    /// The fenced worker is gone or unreachable.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_connection_failure())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }

    /// Flattens into the error reported for the entity.
    pub fn into_processing_error(self, component: &str) -> ProcessingError {
        match self {
            Self::Processing(e) => e,
            Self::Transport(e) => ProcessingError::new(component, e.to_string()),
        }
    }
}

/// A pooled stage instance.
pub enum StageInstance {
    Integrated(Box<dyn CasProcessor>),
    Fenced(FencedProxy),
}

impl StageInstance {
    pub fn process(&mut self, cas: &mut Cas) -> Result<(), InvocationError> {
        match self {
            Self::Integrated(processor) => processor.process(cas).map_err(Into::into),
            Self::Fenced(proxy) => proxy.process(cas).map_err(Into::into),
        }
    }

    pub fn is_stateless(&self) -> bool {
        match self {
            Self::Integrated(processor) => processor.is_stateless(),
            Self::Fenced(_) => false,
        }
    }

    /// Component metadata. Fenced instances ask their worker.
    pub fn metadata(&mut self) -> Result<ProcessingResourceMetaData, InvocationError> {
        match self {
            Self::Integrated(processor) => Ok(processor.metadata()),
            Self::Fenced(proxy) => proxy.metadata().map_err(Into::into),
        }
    }

    pub fn batch_process_complete(&mut self) -> Result<(), InvocationError> {
        match self {
            Self::Integrated(processor) => processor.batch_process_complete().map_err(Into::into),
            Self::Fenced(proxy) => proxy.batch_process_complete().map_err(Into::into),
        }
    }

    pub fn collection_process_complete(&mut self) -> Result<(), InvocationError> {
        match self {
            Self::Integrated(processor) => {
                processor.collection_process_complete().map_err(Into::into)
            }
            Self::Fenced(proxy) => proxy.collection_process_complete().map_err(Into::into),
        }
    }

    /// Bytes exchanged with a fenced worker since the last call, then resets.
    pub fn take_traffic(&mut self) -> (u64, u64) {
        match self {
            Self::Integrated(_) => (0, 0),
            Self::Fenced(proxy) => proxy.take_traffic(),
        }
    }

    /// A fenced call timed out while the worker was still running it.
    ///
    /// A stalled instance must not serve another call until
    /// [`await_late_reply`](Self::await_late_reply) succeeds.
    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Fenced(proxy) if proxy.is_stalled())
    }

    pub fn interrupter(&self) -> Option<CallInterrupter> {
        match self {
            Self::Fenced(proxy) => proxy.interrupter(),
            Self::Integrated(_) => None,
        }
    }

    pub fn await_late_reply(&mut self) -> Result<(), InvocationError> {
        match self {
            Self::Fenced(proxy) => proxy.await_late_reply().map_err(Into::into),
            Self::Integrated(_) => Ok(()),
        }
    }

    pub fn as_fenced_mut(&mut self) -> Option<&mut FencedProxy> {
        match self {
            Self::Fenced(proxy) => Some(proxy),
            Self::Integrated(_) => None,
        }
    }

    pub fn is_fenced(&self) -> bool {
        matches!(self, Self::Fenced(_))
    }
}

impl std::fmt::Debug for StageInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integrated(_) => f.write_str("StageInstance::Integrated"),
            Self::Fenced(proxy) => f.debug_tuple("StageInstance::Fenced").field(proxy).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Failing;

    impl CasProcessor for Failing {
        fn process(&mut self, _cas: &mut Cas) -> Result<(), ProcessingError> {
            Err(ProcessingError::new("failing", "always"))
        }

        fn metadata(&self) -> ProcessingResourceMetaData {
            ProcessingResourceMetaData::named("failing")
        }
    }

    #[test]
    fn test_integrated_error_is_not_connection_failure() {
        let mut instance = StageInstance::Integrated(Box::new(Failing));
        let err = instance.process(&mut Cas::new()).unwrap_err();
        assert!(!err.is_connection_failure());
        assert_eq!(err.into_processing_error("stage").component, "failing");
        assert_eq!(instance.take_traffic(), (0, 0));
        assert!(instance.is_stateless());
    }

    #[test]
    fn test_transport_errors_classified() {
        let timeout = InvocationError::from(TransportError::Timeout {
            timeout: Duration::from_millis(5),
        });
        assert!(timeout.is_timeout());
        assert!(!timeout.is_connection_failure());

        let unbound = InvocationError::from(TransportError::NotBound);
        assert!(unbound.is_connection_failure());
        let flattened = unbound.into_processing_error("remote-stage");
        assert_eq!(flattened.component, "remote-stage");
    }
}
