//! Integration tests for fenced stages.
//!
//! Workers run as [`ThreadProcessController`] servers on loopback ports, so
//! every call crosses a real socket while the test can still observe the
//! stage instances through shared counters.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpe::cas::{Cas, ProcessingResourceMetaData};
use cpe::container::{CasProcessorConfig, ProcessingContainer, StageOutcome};
use cpe::deployer::{FencedDeployer, ProcessController, ThreadProcessController};
use cpe::engine::{CpmConfig, CpmEngine, ListenerSet, RunState, StatusListener};
use cpe::error::{DeploymentError, ProcessingError};
use cpe::processor::{CasProcessor, ProcessorFactory};
use cpe::transport::{Endpoint, JsonCasCodec, SocketTransport};

use common::{wait_until, RecordingListener, ScriptedStage, VecReader};

fn controller(factory: ProcessorFactory) -> Arc<ThreadProcessController> {
    Arc::new(ThreadProcessController::new(factory, Arc::new(JsonCasCodec)))
}

// =============================================================================
// End-to-end
// =============================================================================

#[test]
fn test_fenced_and_integrated_stages_end_to_end() {
    let a = ScriptedStage::new("A").with_delay(Duration::from_millis(15));
    let b = ScriptedStage::new("B");
    let workers = controller(a.factory());
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig {
            pipelines: 4,
            parallel: true,
            ..CpmConfig::default()
        })
        .reader(VecReader::numbered(10))
        .fenced_stage(
            CasProcessorConfig::new("A").with_pool_size(2),
            Arc::clone(&workers) as Arc<dyn ProcessController>,
        )
        .integrated_stage(CasProcessorConfig::new("B"), b.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(engine.state(), RunState::Completed);
    let entities = listener.entities.lock().clone();
    assert_eq!(entities.len(), 10);
    for seen in &entities {
        assert!(!seen.status.is_exception(), "{:?}", seen.status);
        // Metadata written by the worker survives the round trip
        assert_eq!(seen.trail, vec!["A", "B"]);
    }

    assert!(a.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(a.calls.load(Ordering::SeqCst), 10);
    assert_eq!(workers.deployed_count(), 2);
    assert_eq!(workers.live_workers(), 0);

    let report = engine.get_performance_report();
    let stage = report.container("A").unwrap();
    assert_eq!(stage.stats.processed, 10);
    assert!(stage.peak_in_use <= 2);
    assert!(stage.stats.bytes_sent > 0);
    assert!(stage.stats.bytes_received > 0);
}

// =============================================================================
// Worker failures
// =============================================================================

/// Crashes every worker once the engine finishes deploying.
struct CrashOnStart {
    workers: Arc<ThreadProcessController>,
}

impl StatusListener for CrashOnStart {
    fn initialization_complete(&self) {
        for endpoint in self.workers.endpoints() {
            self.workers.crash(&endpoint);
        }
    }
}

#[test]
fn test_crashed_workers_are_redeployed() {
    let a = ScriptedStage::new("A");
    let workers = controller(a.factory());
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig::default())
        .reader(VecReader::numbered(6))
        .fenced_stage(
            CasProcessorConfig::new("A").with_pool_size(2).with_max_restarts(5),
            Arc::clone(&workers) as Arc<dyn ProcessController>,
        )
        .listener(Arc::new(CrashOnStart {
            workers: Arc::clone(&workers),
        }))
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(engine.state(), RunState::Completed);
    assert!(engine.last_error().is_none());

    // The entity that hit the dead worker fails; the rest go to fresh workers
    let seen = listener.seen("E1").unwrap();
    assert!(seen.status.is_exception());
    for id in ["E2", "E3", "E4", "E5", "E6"] {
        assert!(!listener.seen(id).unwrap().status.is_exception(), "{}", id);
    }

    assert_eq!(workers.deployed_count(), 4);
    assert_eq!(engine.containers()[0].restarts(), 1);
    let report = engine.get_performance_report();
    assert_eq!(report.container("A").unwrap().stats.restarts, 1);
    assert_eq!(report.entities_failed, 1);
}

#[test]
fn test_restart_budget_exhaustion_disables_stage() {
    let a = ScriptedStage::new("A");
    let workers = controller(a.factory());
    let crasher = Arc::new(CrashEveryDeploy {
        inner: Arc::clone(&workers),
    });
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig::default())
        .reader(VecReader::numbered(5))
        .fenced_stage(
            CasProcessorConfig::new("A")
                .with_max_restarts(1)
                .with_action_on_max_restarts(cpe::container::RestartAction::Disable),
            crasher as Arc<dyn ProcessController>,
        )
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(engine.state(), RunState::Completed);
    assert_eq!(*listener.disabled.lock(), vec!["A".to_string()]);
    assert_eq!(a.calls.load(Ordering::SeqCst), 0);
    let skipped = listener
        .entities
        .lock()
        .iter()
        .filter(|s| s.status.skipped_stages == vec!["A".to_string()])
        .count();
    assert!(skipped >= 3);
}

/// Deploys workers that are already dead.
struct CrashEveryDeploy {
    inner: Arc<ThreadProcessController>,
}

impl ProcessController for CrashEveryDeploy {
    fn deploy(&self, stage: &str, count: usize) -> Result<Vec<Endpoint>, DeploymentError> {
        let endpoints = self.inner.deploy(stage, count)?;
        for endpoint in &endpoints {
            self.inner.crash(endpoint);
        }
        Ok(endpoints)
    }

    fn undeploy(&self, endpoint: &Endpoint) -> Result<(), DeploymentError> {
        self.inner.undeploy(endpoint)
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Sleeps well past any reasonable call timeout on one document.
struct Sluggish {
    slow_document: &'static str,
}

impl CasProcessor for Sluggish {
    fn process(&mut self, cas: &mut Cas) -> Result<(), ProcessingError> {
        if cas.document_id() == Some(self.slow_document) {
            thread::sleep(Duration::from_millis(600));
        }
        cas.set_metadata("seen", true);
        Ok(())
    }

    fn metadata(&self) -> ProcessingResourceMetaData {
        ProcessingResourceMetaData::named("sluggish")
    }
}

#[test]
fn test_call_timeout_fails_only_the_slow_entity() {
    let factory: ProcessorFactory =
        Arc::new(|| Ok(Box::new(Sluggish { slow_document: "E2" }) as Box<dyn CasProcessor>));
    let workers = controller(factory);
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig::default())
        .reader(VecReader::numbered(4))
        .fenced_stage(
            CasProcessorConfig::new("slow").with_call_timeout(Duration::from_millis(100)),
            Arc::clone(&workers) as Arc<dyn ProcessController>,
        )
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(engine.state(), RunState::Completed);
    let e2 = listener.seen("E2").unwrap();
    assert_eq!(e2.status.exceptions.len(), 1);
    assert_eq!(e2.status.exceptions[0].component, "slow");
    for id in ["E1", "E3", "E4"] {
        assert!(!listener.seen(id).unwrap().status.is_exception(), "{}", id);
    }

    let stats = engine.get_performance_report().container("slow").unwrap().stats;
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.failed, 1);
    // A timeout is not a dead worker
    assert_eq!(stats.restarts, 0);
    assert_eq!(workers.deployed_count(), 1);
}

/// Stalls on the first call any worker receives and counts concurrent calls
/// across all workers.
#[derive(Clone)]
struct StallsOnce {
    stall: Duration,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl StallsOnce {
    fn new(stall: Duration) -> Self {
        Self {
            stall,
            calls: Arc::default(),
            in_flight: Arc::default(),
            peak: Arc::default(),
        }
    }

    fn factory(&self) -> ProcessorFactory {
        let template = self.clone();
        Arc::new(move || Ok(Box::new(template.clone()) as Box<dyn CasProcessor>))
    }
}

impl CasProcessor for StallsOnce {
    fn process(&mut self, _cas: &mut Cas) -> Result<(), ProcessingError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(self.stall);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn metadata(&self) -> ProcessingResourceMetaData {
        ProcessingResourceMetaData::named("stalls-once")
    }
}

fn fenced_container(
    workers: &Arc<ThreadProcessController>,
    config: CasProcessorConfig,
) -> ProcessingContainer {
    let deployer = FencedDeployer::new(
        config.name.clone(),
        Arc::clone(workers) as Arc<dyn ProcessController>,
        SocketTransport::new().with_call_timeout(config.call_timeout),
    );
    let container =
        ProcessingContainer::new(config, Box::new(deployer), Arc::new(ListenerSet::new()))
            .unwrap();
    container.deploy().unwrap();
    container
}

#[test]
fn test_timed_out_instance_held_back_until_late_reply() {
    let stage = StallsOnce::new(Duration::from_millis(600));
    let workers = controller(stage.factory());
    let container = fenced_container(
        &workers,
        CasProcessorConfig::new("A").with_call_timeout(Duration::from_millis(200)),
    );

    let start = Instant::now();
    assert!(matches!(
        container.process_cas(&mut Cas::new()),
        StageOutcome::Failed(_)
    ));
    assert_eq!(container.stalled_calls(), 1);
    assert_eq!(container.pool_stats().free, 0);

    // Waits for the worker to finish the stalled call instead of overlapping it
    assert!(matches!(
        container.process_cas(&mut Cas::new()),
        StageOutcome::Processed
    ));
    assert!(start.elapsed() >= Duration::from_millis(550));
    assert_eq!(stage.peak.load(Ordering::SeqCst), 1);
    assert_eq!(stage.calls.load(Ordering::SeqCst), 2);
    assert_eq!(container.stalled_calls(), 0);

    let stats = container.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(workers.deployed_count(), 1);
    container.shutdown();
}

#[test]
fn test_redeploy_cuts_off_stalled_call() {
    let stage = StallsOnce::new(Duration::from_secs(3));
    let workers = controller(stage.factory());
    let container = fenced_container(
        &workers,
        CasProcessorConfig::new("A").with_call_timeout(Duration::from_millis(100)),
    );

    assert!(matches!(
        container.process_cas(&mut Cas::new()),
        StageOutcome::Failed(_)
    ));
    assert_eq!(container.stalled_calls(), 1);

    let start = Instant::now();
    container.redeploy().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(container.stalled_calls(), 0);
    assert_eq!(container.pool_stats().total, 1);
    assert_eq!(workers.deployed_count(), 2);

    assert!(matches!(
        container.process_cas(&mut Cas::new()),
        StageOutcome::Processed
    ));
    container.shutdown();
}

// =============================================================================
// Quiescent redeploy
// =============================================================================

/// Records whether workers were ever torn down while a call was running.
struct QuiescenceWatch {
    inner: Arc<ThreadProcessController>,
    in_flight: Arc<AtomicUsize>,
    violated: AtomicBool,
    undeploys: AtomicUsize,
}

impl ProcessController for QuiescenceWatch {
    fn deploy(&self, stage: &str, count: usize) -> Result<Vec<Endpoint>, DeploymentError> {
        self.inner.deploy(stage, count)
    }

    fn undeploy(&self, endpoint: &Endpoint) -> Result<(), DeploymentError> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            self.violated.store(true, Ordering::SeqCst);
        }
        self.undeploys.fetch_add(1, Ordering::SeqCst);
        self.inner.undeploy(endpoint)
    }
}

#[test]
fn test_manual_redeploy_waits_for_quiescence() {
    let a = ScriptedStage::new("A").with_delay(Duration::from_millis(20));
    let watch = Arc::new(QuiescenceWatch {
        inner: controller(a.factory()),
        in_flight: Arc::clone(&a.in_flight),
        violated: AtomicBool::new(false),
        undeploys: AtomicUsize::new(0),
    });
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig {
            pipelines: 3,
            parallel: true,
            ..CpmConfig::default()
        })
        .reader(VecReader::numbered(30))
        .fenced_stage(
            CasProcessorConfig::new("A").with_pool_size(3),
            Arc::clone(&watch) as Arc<dyn ProcessController>,
        )
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(wait_until(Duration::from_secs(10), || listener.documents().len() >= 3));
    engine.redeploy("A").unwrap();
    engine.wait();

    assert!(!watch.violated.load(Ordering::SeqCst));
    assert_eq!(watch.inner.deployed_count(), 6);
    assert_eq!(watch.undeploys.load(Ordering::SeqCst), 6);
    assert_eq!(engine.get_performance_report().entities_failed, 0);
    assert_eq!(listener.documents().len(), 30);
}

#[test]
fn test_redeploy_unknown_stage() {
    let engine = CpmEngine::builder()
        .reader(VecReader::numbered(1))
        .integrated_stage(CasProcessorConfig::new("A"), ScriptedStage::new("A").factory())
        .build()
        .unwrap();

    assert!(matches!(
        engine.redeploy("missing"),
        Err(cpe::error::EngineError::UnknownStage(_))
    ));
}
