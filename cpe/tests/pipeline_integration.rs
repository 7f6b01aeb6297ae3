//! Integration tests for the collection processing engine.
//!
//! These tests drive complete runs through integrated stages:
//! - Pause on exception with retry and skip
//! - Explicit pause and resume at entity boundaries
//! - Container health thresholds and their actions
//! - Checkpointing and restoring a directory collection
//! - Parallel pipelines

mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpe::checkpoint::{Checkpoint, CheckpointConfig};
use cpe::components::DirectoryReader;
use cpe::container::{CasProcessorConfig, ContainerHealth, ErrorAction};
use cpe::engine::{CpmConfig, CpmEngine, RunState, StatusListener};
use cpe::error::{EngineError, FatalError};
use tempfile::TempDir;

use common::{wait_until, RecordingListener, ScriptedStage, VecReader};

const SETTLE: Duration = Duration::from_secs(10);

fn single_pipeline() -> CpmConfig {
    CpmConfig {
        name: "it".to_string(),
        ..CpmConfig::default()
    }
}

fn pausing() -> CpmConfig {
    CpmConfig {
        pause_on_exception: true,
        ..single_pipeline()
    }
}

// =============================================================================
// Pause on exception
// =============================================================================

#[test]
fn test_failed_entity_retried_from_first_stage() {
    let a = ScriptedStage::new("A");
    let b = ScriptedStage::new("B").failing_on("E3").failing_times(1);
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(pausing())
        .reader(VecReader::numbered(5))
        .integrated_stage(CasProcessorConfig::new("A"), a.factory())
        .integrated_stage(CasProcessorConfig::new("B"), b.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(wait_until(SETTLE, || engine.is_paused()));
    assert_eq!(listener.paused.load(Ordering::SeqCst), 1);
    assert_eq!(listener.documents(), vec!["E1", "E2"]);

    // Nothing after E3 enters the pipeline while paused
    thread::sleep(Duration::from_millis(50));
    assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    assert_eq!(b.calls.load(Ordering::SeqCst), 3);

    engine.resume_with(true);
    engine.wait();

    assert_eq!(engine.state(), RunState::Completed);
    assert_eq!(listener.documents(), vec!["E1", "E2", "E3", "E4", "E5"]);
    assert_eq!(listener.resumed.load(Ordering::SeqCst), 1);
    // E3 went through A twice
    assert_eq!(a.calls.load(Ordering::SeqCst), 6);

    let e3 = listener.seen("E3").unwrap();
    assert_eq!(e3.status.attempts, 2);
    assert!(!e3.status.is_exception());
    // The snapshot discards A's first pass
    assert_eq!(e3.trail, vec!["A", "B"]);

    let report = engine.get_performance_report();
    assert_eq!(report.entities_completed, 5);
    assert_eq!(report.entities_retried, 1);
    assert_eq!(report.entities_failed, 0);
}

#[test]
fn test_failed_entity_skipped_on_plain_resume() {
    let a = ScriptedStage::new("A");
    let b = ScriptedStage::new("B").failing_on("E3");
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(pausing())
        .reader(VecReader::numbered(5))
        .integrated_stage(CasProcessorConfig::new("A"), a.factory())
        .integrated_stage(CasProcessorConfig::new("B"), b.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(wait_until(SETTLE, || engine.is_paused()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    assert!(listener.seen("E4").is_none());

    engine.resume();
    engine.wait();
    assert_eq!(a.calls.load(Ordering::SeqCst), 5);

    assert_eq!(engine.state(), RunState::Completed);
    assert!(engine.last_error().is_none());
    assert_eq!(listener.documents(), vec!["E1", "E2", "E3", "E4", "E5"]);

    let e3 = listener.seen("E3").unwrap();
    assert_eq!(e3.status.exceptions.len(), 1);
    assert_eq!(e3.status.exceptions[0].component, "B");
    assert_eq!(e3.trail, vec!["A"]);
    assert_eq!(listener.seen("E4").unwrap().trail, vec!["A", "B"]);

    let report = engine.get_performance_report();
    assert_eq!(report.entities_failed, 1);
    assert_eq!(report.entities_retried, 0);
}

#[test]
fn test_failure_without_pause_moves_on() {
    let b = ScriptedStage::new("B").failing_on("E2");
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(VecReader::numbered(3))
        .integrated_stage(CasProcessorConfig::new("B"), b.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(listener.paused.load(Ordering::SeqCst), 0);
    assert!(listener.seen("E2").unwrap().status.is_exception());
    assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Pause and resume on request
// =============================================================================

#[test]
fn test_pause_holds_pipeline_at_boundary() {
    let slow = ScriptedStage::new("slow").with_delay(Duration::from_millis(20));
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(VecReader::numbered(20))
        .integrated_stage(CasProcessorConfig::new("slow"), slow.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    assert!(wait_until(SETTLE, || !listener.documents().is_empty()));
    engine.pause();
    assert!(engine.is_paused());

    // Let any in-flight entity finish, then nothing else may complete
    thread::sleep(Duration::from_millis(100));
    let held = listener.documents().len();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(listener.documents().len(), held);
    assert!(held < 20);

    engine.resume();
    engine.wait();
    assert_eq!(listener.documents().len(), 20);
    assert_eq!(listener.paused.load(Ordering::SeqCst), 1);
    assert_eq!(listener.resumed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_while_paused_ends_run() {
    let slow = ScriptedStage::new("slow").with_delay(Duration::from_millis(10));
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(VecReader::numbered(50))
        .integrated_stage(CasProcessorConfig::new("slow"), slow.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.pause();
    engine.stop();
    engine.wait();

    assert_eq!(engine.state(), RunState::Stopped);
    assert!(listener.documents().len() < 50);
    assert_eq!(listener.completed.load(Ordering::SeqCst), 0);
    assert_eq!(listener.aborted.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Health thresholds
// =============================================================================

fn always_failing(name: &str, documents: usize) -> ScriptedStage {
    (1..=documents).fold(ScriptedStage::new(name), |stage, i| {
        stage.failing_on(&format!("E{}", i))
    })
}

#[test]
fn test_threshold_disables_container_once() {
    let b = always_failing("B", 6);
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(VecReader::numbered(6))
        .integrated_stage(CasProcessorConfig::new("A"), ScriptedStage::new("A").factory())
        .integrated_stage(
            CasProcessorConfig::new("B")
                .with_max_consecutive_errors(3)
                .with_action_on_max_errors(ErrorAction::Disable),
            b.factory(),
        )
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(*listener.disabled.lock(), vec!["B".to_string()]);
    assert_eq!(engine.containers()[1].health(), ContainerHealth::Disabled);
    assert_eq!(b.calls.load(Ordering::SeqCst), 3);

    for id in ["E1", "E2", "E3"] {
        assert!(listener.seen(id).unwrap().status.is_exception(), "{} should fail", id);
    }
    for id in ["E4", "E5", "E6"] {
        let seen = listener.seen(id).unwrap();
        assert!(!seen.status.is_exception());
        assert_eq!(seen.status.skipped_stages, vec!["B"]);
        assert_eq!(seen.trail, vec!["A"]);
    }

    let report = engine.get_performance_report();
    assert_eq!(report.entities_failed, 3);
    assert_eq!(report.container("B").unwrap().stats.skipped, 3);
}

#[test]
fn test_threshold_terminate_aborts_run() {
    let b = always_failing("B", 10);
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(VecReader::numbered(10))
        .integrated_stage(
            CasProcessorConfig::new("B")
                .with_max_consecutive_errors(2)
                .with_action_on_max_errors(ErrorAction::Terminate),
            b.factory(),
        )
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    assert_eq!(engine.state(), RunState::Stopped);
    assert!(matches!(
        engine.last_error(),
        Some(FatalError::StageTerminated { ref container, .. }) if container == "B"
    ));
    assert_eq!(listener.documents(), vec!["E1", "E2"]);
    assert_eq!(listener.aborted.load(Ordering::SeqCst), 1);
    assert_eq!(listener.completed.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Checkpointing
// =============================================================================

fn write_corpus(dir: &TempDir, count: usize) -> std::path::PathBuf {
    let corpus = dir.path().join("corpus");
    fs::create_dir_all(&corpus).unwrap();
    for i in 0..count {
        fs::write(corpus.join(format!("doc{}.txt", i)), format!("text {}", i)).unwrap();
    }
    corpus
}

#[test]
fn test_checkpoint_then_restore_continues_collection() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(&temp, 6);
    let checkpoint_path = temp.path().join("state").join("run.ckpt");

    let first = Arc::new(RecordingListener::default());
    let engine = CpmEngine::builder()
        .config(CpmConfig {
            entity_limit: 4,
            checkpoint: Some(CheckpointConfig::new(&checkpoint_path).with_batch(2)),
            ..single_pipeline()
        })
        .reader(DirectoryReader::open(&corpus, Some("txt")).unwrap())
        .integrated_stage(CasProcessorConfig::new("A"), ScriptedStage::new("A").factory())
        .listener(Arc::clone(&first) as Arc<dyn StatusListener>)
        .build()
        .unwrap();
    engine.process().unwrap();
    engine.wait();

    assert_eq!(first.documents(), vec!["doc0.txt", "doc1.txt", "doc2.txt", "doc3.txt"]);
    let checkpoint = Checkpoint::load(&checkpoint_path).unwrap();
    assert_eq!(
        checkpoint.synch_point.map(|p| p.0),
        Some(serde_json::json!({ "next_index": 4 }))
    );
    assert_eq!(checkpoint.report.entities_completed, 4);

    let second = Arc::new(RecordingListener::default());
    let resumed = CpmEngine::builder()
        .config(single_pipeline())
        .reader(DirectoryReader::open(&corpus, Some("txt")).unwrap())
        .integrated_stage(CasProcessorConfig::new("A"), ScriptedStage::new("A").factory())
        .listener(Arc::clone(&second) as Arc<dyn StatusListener>)
        .build()
        .unwrap();
    resumed.restore_checkpoint(&checkpoint_path).unwrap();
    resumed.process().unwrap();
    resumed.wait();

    assert_eq!(second.documents(), vec!["doc4.txt", "doc5.txt"]);
}

#[test]
fn test_restore_rejected_after_start() {
    let temp = TempDir::new().unwrap();
    let corpus = write_corpus(&temp, 1);

    let engine = CpmEngine::builder()
        .config(single_pipeline())
        .reader(DirectoryReader::open(&corpus, None).unwrap())
        .integrated_stage(CasProcessorConfig::new("A"), ScriptedStage::new("A").factory())
        .build()
        .unwrap();
    engine.process().unwrap();
    engine.wait();

    let err = engine
        .restore_checkpoint(&temp.path().join("missing.ckpt"))
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRunning { .. }));
    assert!(matches!(engine.process(), Err(EngineError::AlreadyRunning { .. })));
}

// =============================================================================
// Parallel pipelines
// =============================================================================

#[test]
fn test_parallel_pipelines_process_each_entity_once() {
    let stage = ScriptedStage::new("A").with_delay(Duration::from_millis(2));
    let listener = Arc::new(RecordingListener::default());

    let engine = CpmEngine::builder()
        .config(CpmConfig {
            pipelines: 4,
            parallel: true,
            batch_size: 10,
            ..single_pipeline()
        })
        .reader(VecReader::numbered(40))
        .integrated_stage(CasProcessorConfig::new("A").with_pool_size(4), stage.factory())
        .listener(Arc::clone(&listener) as Arc<dyn StatusListener>)
        .build()
        .unwrap();

    engine.process().unwrap();
    engine.wait();

    let documents = listener.documents();
    let unique: HashSet<_> = documents.iter().collect();
    assert_eq!(documents.len(), 40);
    assert_eq!(unique.len(), 40);
    assert_eq!(listener.batches.load(Ordering::SeqCst), 4);
    assert!(stage.peak.load(Ordering::SeqCst) <= 4);

    let progress = engine.get_progress();
    assert_eq!(progress[0].completed, 40);
    assert_eq!(progress[0].fraction(), Some(1.0));
}
