//! Status callbacks.
//!
//! The engine reports progress by invoking [`StatusListener`] callbacks and
//! does not know how they are consumed. Callbacks run on engine threads
//! (pipeline threads for per-entity events) and must return promptly.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::cas::Cas;
use crate::error::ProcessingError;

/// Outcome of one entity's traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityStatus {
    /// Order in which the entity was read, starting at 1.
    pub sequence: u64,
    pub document_id: Option<String>,
    /// Failures that ended the traversal. Empty on success.
    pub exceptions: Vec<ProcessingError>,
    /// Stages bypassed because their container was disabled.
    pub skipped_stages: Vec<String>,
    /// Number of traversals, greater than 1 after a retry.
    pub attempts: u32,
}

impl EntityStatus {
    pub fn is_exception(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

/// Receives engine lifecycle and per-entity events.
///
/// Every method has an empty default so listeners implement only what they
/// need.
pub trait StatusListener: Send + Sync {
    /// Setup finished; entities are about to flow.
    fn initialization_complete(&self) {}

    /// One entity finished its traversal, successfully or not.
    fn entity_process_complete(&self, _cas: &Cas, _status: &EntityStatus) {}

    /// The run was stopped or hit a fatal error.
    fn aborted(&self) {}

    /// A batch of `[cpe] batch_size` entities completed.
    fn batch_process_complete(&self) {}

    /// The whole collection was processed.
    fn collection_process_complete(&self) {}

    fn paused(&self) {}

    fn resumed(&self) {}

    /// A container was disabled by its error policy.
    fn processor_disabled(&self, _container: &str) {}
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusListener;

impl StatusListener for NullStatusListener {}

/// Listener that logs events using the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusListener;

impl StatusListener for TracingStatusListener {
    fn initialization_complete(&self) {
        tracing::info!("Initialization complete");
    }

    fn entity_process_complete(&self, _cas: &Cas, status: &EntityStatus) {
        let document = status.document_id.as_deref().unwrap_or("-");
        if status.is_exception() {
            for error in &status.exceptions {
                tracing::warn!(
                    entity = status.sequence,
                    document = %document,
                    component = %error.component,
                    error = %error.message,
                    "Entity failed"
                );
            }
        } else {
            tracing::debug!(
                entity = status.sequence,
                document = %document,
                skipped = status.skipped_stages.len(),
                "Entity processed"
            );
        }
    }

    fn aborted(&self) {
        tracing::warn!("Processing aborted");
    }

    fn batch_process_complete(&self) {
        tracing::info!("Batch complete");
    }

    fn collection_process_complete(&self) {
        tracing::info!("Collection processing complete");
    }

    fn paused(&self) {
        tracing::info!("Processing paused");
    }

    fn resumed(&self) {
        tracing::info!("Processing resumed");
    }

    fn processor_disabled(&self, container: &str) {
        tracing::warn!(container = %container, "Processor disabled");
    }
}

/// Fan-out to any number of listeners.
///
/// Listeners may be added or removed while a run is in progress. Each event
/// is delivered to the listeners registered when it fires.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn StatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes `listener` by identity. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn StatusListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    // Snapshot so callbacks may register or remove listeners.
    fn snapshot(&self) -> Vec<Arc<dyn StatusListener>> {
        self.listeners.read().clone()
    }
}

impl StatusListener for ListenerSet {
    fn initialization_complete(&self) {
        self.snapshot().iter().for_each(|l| l.initialization_complete());
    }

    fn entity_process_complete(&self, cas: &Cas, status: &EntityStatus) {
        self.snapshot()
            .iter()
            .for_each(|l| l.entity_process_complete(cas, status));
    }

    fn aborted(&self) {
        self.snapshot().iter().for_each(|l| l.aborted());
    }

    fn batch_process_complete(&self) {
        self.snapshot().iter().for_each(|l| l.batch_process_complete());
    }

    fn collection_process_complete(&self) {
        self.snapshot()
            .iter()
            .for_each(|l| l.collection_process_complete());
    }

    fn paused(&self) {
        self.snapshot().iter().for_each(|l| l.paused());
    }

    fn resumed(&self) {
        self.snapshot().iter().for_each(|l| l.resumed());
    }

    fn processor_disabled(&self, container: &str) {
        self.snapshot()
            .iter()
            .for_each(|l| l.processor_disabled(container));
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listener_count", &self.len())
            .finish()
    }
}
