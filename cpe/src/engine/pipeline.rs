//! Processing units.
//!
//! Each pipeline thread repeatedly reads one entity into a pooled CAS, pushes
//! it through every container in order and reports the outcome. All
//! pipelines share one [`PipelineContext`].

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::control::{ResumeDecision, RunControl};
use super::listener::{EntityStatus, ListenerSet, StatusListener};
use super::reader::{CollectionReader, Progress, SynchPoint, UNIT_ENTITIES};
use super::report::{EngineCounters, PerformanceReport};
use crate::cas::{Cas, CasManager};
use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::container::{ProcessingContainer, StageFailure, StageOutcome};
use crate::error::{FatalError, ReaderError};

/// CAS pool consumer used by pipeline threads.
pub(crate) const ENGINE_CONSUMER: &str = "engine";

/// The reader plus the bookkeeping that must change under the same lock.
pub(crate) struct ReaderSlot {
    pub reader: Box<dyn CollectionReader>,
    pub read: u64,
    pub exhausted: bool,
}

/// State shared by the facade, the monitor and every pipeline thread.
pub(crate) struct PipelineContext {
    pub name: String,
    pub pause_on_exception: bool,
    pub batch_size: u64,
    pub entity_limit: u64,
    pub control: RunControl,
    pub reader: Mutex<ReaderSlot>,
    pub containers: Vec<ProcessingContainer>,
    pub cas_manager: CasManager,
    pub listeners: Arc<ListenerSet>,
    pub counters: EngineCounters,
    pub checkpoint: Option<CheckpointWriter>,
    pub started: Mutex<Option<Instant>>,
    pub elapsed: Mutex<Option<Duration>>,
}

struct Traversal {
    skipped: Vec<String>,
    failure: Option<StageFailure>,
}

impl PipelineContext {
    /// Body of one pipeline thread.
    pub fn run_pipeline(&self, id: usize) {
        debug!(pipeline = id, "Pipeline started");
        loop {
            if !self.control.wait_at_boundary() {
                break;
            }

            let mut cas = match self.cas_manager.get_cas(ENGINE_CONSUMER) {
                Ok(cas) => cas,
                Err(e) => {
                    if self.control.state().is_active() {
                        error!(pipeline = id, error = %e, "CAS pool unavailable");
                        self.control.abort(FatalError::CasPool(e.to_string()));
                    }
                    break;
                }
            };

            let sequence = match self.next_entity(&mut cas) {
                Ok(Some(sequence)) => sequence,
                Ok(None) => break,
                Err(e) => {
                    error!(pipeline = id, error = %e, "Collection reader failed");
                    self.control.abort(FatalError::Reader(e.to_string()));
                    break;
                }
            };

            if !self.process_entity(sequence, &mut cas) {
                break;
            }
        }
        debug!(pipeline = id, "Pipeline finished");
    }

    /// Reads the next entity under the reader lock.
    fn next_entity(&self, cas: &mut Cas) -> Result<Option<u64>, ReaderError> {
        let mut slot = self.reader.lock();
        if slot.exhausted {
            return Ok(None);
        }
        if self.entity_limit > 0 && slot.read >= self.entity_limit {
            slot.exhausted = true;
            info!(limit = self.entity_limit, "Entity limit reached");
            return Ok(None);
        }
        if !slot.reader.has_next()? {
            slot.exhausted = true;
            return Ok(None);
        }
        slot.reader.get_next(cas)?;
        slot.read += 1;
        self.counters.read.fetch_add(1, Ordering::Relaxed);
        Ok(Some(slot.read))
    }

    /// Drives one entity to completion. Returns `false` when the pipeline
    /// must stop.
    fn process_entity(&self, sequence: u64, cas: &mut Cas) -> bool {
        let snapshot = self.pause_on_exception.then(|| cas.snapshot());
        let mut attempts = 0;

        loop {
            attempts += 1;
            let traversal = self.traverse(cas);
            let Some(failure) = traversal.failure else {
                self.finish_entity(cas, sequence, attempts, traversal.skipped, None);
                return true;
            };

            if let Some(fatal) = failure.fatal {
                error!(entity = sequence, error = %fatal, "Fatal stage failure");
                self.finish_entity(cas, sequence, attempts, traversal.skipped, Some(failure.error));
                self.control.abort(fatal);
                return false;
            }

            let Some(snapshot) = &snapshot else {
                self.finish_entity(cas, sequence, attempts, traversal.skipped, Some(failure.error));
                return true;
            };

            let Some((epoch, transitioned)) = self.control.enter_failure_pause() else {
                self.finish_entity(cas, sequence, attempts, traversal.skipped, Some(failure.error));
                return false;
            };
            if transitioned {
                warn!(
                    entity = sequence,
                    component = %failure.error.component,
                    "Paused on processing error"
                );
                self.listeners.paused();
            }

            match self.control.await_resume(epoch) {
                ResumeDecision::Retry => {
                    debug!(entity = sequence, "Retrying entity from the first stage");
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    cas.restore(snapshot);
                }
                ResumeDecision::Skip => {
                    self.finish_entity(cas, sequence, attempts, traversal.skipped, Some(failure.error));
                    return true;
                }
                ResumeDecision::Stop => {
                    self.finish_entity(cas, sequence, attempts, traversal.skipped, Some(failure.error));
                    return false;
                }
            }
        }
    }

    fn traverse(&self, cas: &mut Cas) -> Traversal {
        let mut skipped = Vec::new();
        for container in &self.containers {
            match container.process_cas(cas) {
                StageOutcome::Processed => {}
                StageOutcome::Skipped => skipped.push(container.name().to_string()),
                StageOutcome::Failed(failure) => {
                    return Traversal {
                        skipped,
                        failure: Some(failure),
                    }
                }
            }
        }
        Traversal {
            skipped,
            failure: None,
        }
    }

    fn finish_entity(
        &self,
        cas: &Cas,
        sequence: u64,
        attempts: u32,
        skipped_stages: Vec<String>,
        error: Option<crate::error::ProcessingError>,
    ) {
        if error.is_some() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let status = EntityStatus {
            sequence,
            document_id: cas.document_id().map(str::to_string),
            exceptions: error.into_iter().collect(),
            skipped_stages,
            attempts,
        };
        self.listeners.entity_process_complete(cas, &status);

        let completed = self.counters.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.batch_size > 0 && completed % self.batch_size == 0 {
            self.listeners.batch_process_complete();
        }
        if let Some(writer) = &self.checkpoint {
            if writer.is_due(completed) {
                self.write_checkpoint(writer);
            }
        }
    }

    pub fn write_checkpoint(&self, writer: &CheckpointWriter) {
        let checkpoint = Checkpoint {
            synch_point: self.synch_point(),
            progress: self.progress(),
            report: self.report(),
            written_at: Utc::now(),
        };
        if let Err(e) = writer.write(&checkpoint) {
            warn!(error = %e, "Failed to write checkpoint");
        }
    }

    pub fn synch_point(&self) -> Option<SynchPoint> {
        self.reader.lock().reader.synch_point()
    }

    /// Reader progress, or the engine's entity count if the reader reports none.
    pub fn progress(&self) -> Vec<Progress> {
        let progress = self.reader.lock().reader.progress();
        if progress.is_empty() {
            vec![Progress::new(self.counters.completed(), None, UNIT_ENTITIES)]
        } else {
            progress
        }
    }

    pub fn elapsed(&self) -> Duration {
        if let Some(elapsed) = *self.elapsed.lock() {
            return elapsed;
        }
        self.started
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn report(&self) -> PerformanceReport {
        PerformanceReport::collect(
            &self.name,
            self.control.state(),
            self.elapsed(),
            &self.counters,
            &self.containers,
        )
    }
}
