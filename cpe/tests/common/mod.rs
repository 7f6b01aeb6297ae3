//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cpe::cas::{Cas, ProcessingResourceMetaData};
use cpe::engine::{CollectionReader, EntityStatus, Progress, StatusListener, UNIT_ENTITIES};
use cpe::error::{ProcessingError, ReaderError};
use cpe::processor::{CasProcessor, ProcessorFactory};

// =============================================================================
// Reader
// =============================================================================

/// Serves documents `E1..En` from memory.
pub struct VecReader {
    pending: VecDeque<(String, String)>,
    total: u64,
    served: u64,
}

impl VecReader {
    pub fn numbered(count: usize) -> Self {
        let pending: VecDeque<_> = (1..=count)
            .map(|i| (format!("E{}", i), format!("entity number {}", i)))
            .collect();
        Self {
            total: pending.len() as u64,
            pending,
            served: 0,
        }
    }
}

impl CollectionReader for VecReader {
    fn has_next(&mut self) -> Result<bool, ReaderError> {
        Ok(!self.pending.is_empty())
    }

    fn get_next(&mut self, cas: &mut Cas) -> Result<(), ReaderError> {
        let (id, text) = self
            .pending
            .pop_front()
            .ok_or_else(|| ReaderError::Failed("collection exhausted".into()))?;
        cas.set_document_id(id);
        cas.set_document_text(text);
        self.served += 1;
        Ok(())
    }

    fn progress(&self) -> Vec<Progress> {
        vec![Progress::new(self.served, Some(self.total), UNIT_ENTITIES)]
    }
}

// =============================================================================
// Stages
// =============================================================================

/// Appends its name to the `trail` metadata list. Fails for documents in
/// `fail_on` while `failures_left` is non-zero, and sleeps `delay` per call.
pub struct ScriptedStage {
    pub name: String,
    pub fail_on: Vec<String>,
    pub failures_left: Arc<AtomicUsize>,
    pub delay: Duration,
    pub calls: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl ScriptedStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_on: Vec::new(),
            failures_left: Arc::new(AtomicUsize::new(usize::MAX)),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_on(mut self, document: &str) -> Self {
        self.fail_on.push(document.to_string());
        self
    }

    pub fn failing_times(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Factory whose instances share this stage's script and counters.
    pub fn factory(&self) -> ProcessorFactory {
        let template = self.share();
        Arc::new(move || Ok(Box::new(template.share()) as Box<dyn CasProcessor>))
    }

    fn share(&self) -> Self {
        Self {
            name: self.name.clone(),
            fail_on: self.fail_on.clone(),
            failures_left: Arc::clone(&self.failures_left),
            delay: self.delay,
            calls: Arc::clone(&self.calls),
            in_flight: Arc::clone(&self.in_flight),
            peak: Arc::clone(&self.peak),
        }
    }

    fn should_fail(&self, cas: &Cas) -> bool {
        let Some(id) = cas.document_id() else {
            return false;
        };
        if !self.fail_on.iter().any(|f| f == id) {
            return false;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl CasProcessor for ScriptedStage {
    fn process(&mut self, cas: &mut Cas) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.should_fail(cas) {
            return Err(ProcessingError::new(&self.name, "scripted failure"));
        }

        let mut trail = cas
            .metadata("trail")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        trail.push(serde_json::Value::from(self.name.clone()));
        cas.set_metadata("trail", trail);
        Ok(())
    }

    fn metadata(&self) -> ProcessingResourceMetaData {
        ProcessingResourceMetaData::named(self.name.clone())
    }
}

// =============================================================================
// Listener
// =============================================================================

/// One completed entity as seen by a listener.
#[derive(Debug, Clone)]
pub struct Seen {
    pub status: EntityStatus,
    pub trail: Vec<String>,
}

/// Records every callback for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    pub entities: Mutex<Vec<Seen>>,
    pub disabled: Mutex<Vec<String>>,
    pub paused: AtomicUsize,
    pub resumed: AtomicUsize,
    pub batches: AtomicUsize,
    pub completed: AtomicUsize,
    pub aborted: AtomicUsize,
}

impl RecordingListener {
    pub fn seen(&self, document: &str) -> Option<Seen> {
        self.entities
            .lock()
            .iter()
            .find(|s| s.status.document_id.as_deref() == Some(document))
            .cloned()
    }

    pub fn documents(&self) -> Vec<String> {
        self.entities
            .lock()
            .iter()
            .filter_map(|s| s.status.document_id.clone())
            .collect()
    }
}

impl StatusListener for RecordingListener {
    fn entity_process_complete(&self, cas: &Cas, status: &EntityStatus) {
        let trail = cas
            .metadata("trail")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        self.entities.lock().push(Seen {
            status: status.clone(),
            trail,
        });
    }

    fn aborted(&self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_process_complete(&self) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }

    fn collection_process_complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn paused(&self) {
        self.paused.fetch_add(1, Ordering::SeqCst);
    }

    fn resumed(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn processor_disabled(&self, container: &str) {
        self.disabled.lock().push(container.to_string());
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
