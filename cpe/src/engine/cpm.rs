//! The CPM engine facade.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{error, info, warn};

use super::control::RunControl;
use super::listener::{ListenerSet, StatusListener};
use super::pipeline::{PipelineContext, ReaderSlot, ENGINE_CONSUMER};
use super::reader::{CollectionReader, Progress, SynchPoint};
use super::report::{EngineCounters, PerformanceReport};
use super::state::RunState;
use crate::cas::{CasManager, CasTuning};
use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointWriter};
use crate::container::{CasProcessorConfig, ProcessingContainer};
use crate::deployer::{
    CasProcessorDeployer, DeploymentKind, FencedDeployer, IntegratedDeployer, ProcessController,
};
use crate::error::{ConfigurationError, EngineError, FatalError};
use crate::processor::ProcessorFactory;
use crate::transport::SocketTransport;

/// Default engine name.
pub const DEFAULT_ENGINE_NAME: &str = "cpe";

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CpmConfig {
    pub name: String,
    /// Pipeline threads when `parallel` is set.
    pub pipelines: usize,
    pub parallel: bool,
    /// CAS instances shared by the pipelines. `None` means one per pipeline.
    pub cas_pool_size: Option<usize>,
    /// Pause holding a failed entity instead of moving on.
    pub pause_on_exception: bool,
    /// Completed entities per `batch_process_complete` callback. 0 disables.
    pub batch_size: u64,
    /// Stop after this many entities. 0 reads the whole collection.
    pub entity_limit: u64,
    pub cas_tuning: CasTuning,
    pub checkpoint: Option<CheckpointConfig>,
}

impl Default for CpmConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ENGINE_NAME.to_string(),
            pipelines: 1,
            parallel: false,
            cas_pool_size: None,
            pause_on_exception: false,
            batch_size: 0,
            entity_limit: 0,
            cas_tuning: CasTuning::default(),
            checkpoint: None,
        }
    }
}

impl CpmConfig {
    /// Pipeline threads that will actually run.
    pub fn effective_pipelines(&self) -> usize {
        if self.parallel {
            self.pipelines.max(1)
        } else {
            1
        }
    }

    pub fn effective_cas_pool_size(&self) -> usize {
        self.cas_pool_size.unwrap_or_else(|| self.effective_pipelines())
    }
}

enum StageSpec {
    Integrated(ProcessorFactory),
    Fenced(Arc<dyn ProcessController>),
    Custom(Box<dyn CasProcessorDeployer>),
}

/// Assembles a [`CpmEngine`].
#[derive(Default)]
pub struct CpmEngineBuilder {
    config: CpmConfig,
    reader: Option<Box<dyn CollectionReader>>,
    stages: Vec<(CasProcessorConfig, StageSpec)>,
    listeners: Vec<Arc<dyn StatusListener>>,
    transport: SocketTransport,
}

impl CpmEngineBuilder {
    pub fn config(mut self, config: CpmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn reader(self, reader: impl CollectionReader + 'static) -> Self {
        self.boxed_reader(Box::new(reader))
    }

    pub fn boxed_reader(mut self, reader: Box<dyn CollectionReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Appends an in-process stage.
    pub fn integrated_stage(mut self, config: CasProcessorConfig, factory: ProcessorFactory) -> Self {
        let config = config.with_deployment(DeploymentKind::Integrated);
        self.stages.push((config, StageSpec::Integrated(factory)));
        self
    }

    /// Appends a stage whose workers are launched by `controller`.
    pub fn fenced_stage(
        mut self,
        config: CasProcessorConfig,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        let config = config.with_deployment(DeploymentKind::Fenced);
        self.stages.push((config, StageSpec::Fenced(controller)));
        self
    }

    /// Appends a stage with a caller-supplied deployer.
    pub fn stage(mut self, config: CasProcessorConfig, deployer: Box<dyn CasProcessorDeployer>) -> Self {
        self.stages.push((config, StageSpec::Custom(deployer)));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Transport template for fenced stages. Each stage applies its own call timeout.
    pub fn transport(mut self, transport: SocketTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn build(self) -> Result<CpmEngine, ConfigurationError> {
        let reader = self.reader.ok_or(ConfigurationError::MissingReader)?;
        if self.config.cas_pool_size == Some(0) {
            return Err(ConfigurationError::InvalidPoolSize {
                consumer: ENGINE_CONSUMER.to_string(),
                size: 0,
            });
        }

        let listeners = Arc::new(ListenerSet::new());
        for listener in self.listeners {
            listeners.add(listener);
        }

        let mut names = HashSet::new();
        let mut containers = Vec::with_capacity(self.stages.len());
        for (config, spec) in self.stages {
            if !names.insert(config.name.clone()) {
                return Err(ConfigurationError::DuplicateStage(config.name));
            }
            let deployer: Box<dyn CasProcessorDeployer> = match spec {
                StageSpec::Integrated(factory) => {
                    Box::new(IntegratedDeployer::new(config.name.clone(), factory))
                }
                StageSpec::Fenced(controller) => Box::new(FencedDeployer::new(
                    config.name.clone(),
                    controller,
                    self.transport.clone().with_call_timeout(config.call_timeout),
                )),
                StageSpec::Custom(deployer) => deployer,
            };
            containers.push(ProcessingContainer::new(config, deployer, Arc::clone(&listeners))?);
        }

        let checkpoint = self.config.checkpoint.clone().map(CheckpointWriter::new);
        let context = PipelineContext {
            name: self.config.name.clone(),
            pause_on_exception: self.config.pause_on_exception,
            batch_size: self.config.batch_size,
            entity_limit: self.config.entity_limit,
            control: RunControl::default(),
            reader: Mutex::new(ReaderSlot {
                reader,
                read: 0,
                exhausted: false,
            }),
            containers,
            cas_manager: CasManager::new(),
            listeners,
            counters: EngineCounters::default(),
            checkpoint,
            started: Mutex::new(None),
            elapsed: Mutex::new(None),
        };

        Ok(CpmEngine {
            config: self.config,
            context: Arc::new(context),
            monitor: Mutex::new(None),
        })
    }
}

/// Drives a collection through a pipeline of processing containers.
///
/// `process()` deploys every container, merges type systems into the CAS
/// manager and starts the pipeline threads in the background. A monitor
/// thread waits for the pipelines to finish, delivers end-of-collection
/// notifications and tears everything down.
pub struct CpmEngine {
    config: CpmConfig,
    context: Arc<PipelineContext>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CpmEngine {
    pub fn builder() -> CpmEngineBuilder {
        CpmEngineBuilder::default()
    }

    pub fn config(&self) -> &CpmConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.context.control.state()
    }

    /// Starts processing in the background.
    ///
    /// Fails with [`EngineError::AlreadyRunning`] unless the engine is idle.
    /// Setup failures tear the engine down and leave it stopped.
    pub fn process(&self) -> Result<(), EngineError> {
        self.start(spawn_named)
    }

    fn start(&self, spawn_monitor: Spawner) -> Result<(), EngineError> {
        self.context
            .control
            .try_start()
            .map_err(|state| EngineError::AlreadyRunning { state })?;

        if let Err(e) = self.setup() {
            error!(engine = %self.config.name, error = %e, "Engine setup failed");
            self.context.control.abort(FatalError::Setup(e.to_string()));
            teardown(&self.context);
            self.context.listeners.aborted();
            self.context.control.mark_finished();
            return Err(e);
        }

        *self.context.started.lock() = Some(Instant::now());
        self.context.listeners.initialization_complete();

        let pipelines = self.config.effective_pipelines();
        let mut handles = Vec::with_capacity(pipelines);
        for id in 0..pipelines {
            let context = Arc::clone(&self.context);
            let spawned = thread::Builder::new()
                .name(format!("cpe-pipeline-{}", id))
                .spawn(move || context.run_pipeline(id));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.context
                        .control
                        .abort(FatalError::Setup(format!("failed to spawn pipeline: {}", e)));
                    for handle in handles {
                        let _ = handle.join();
                    }
                    finish_run(&self.context);
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        let handles = Arc::new(Mutex::new(handles));
        let context = Arc::clone(&self.context);
        let joined = Arc::clone(&handles);
        let spawned = spawn_monitor(
            "cpe-monitor".to_string(),
            Box::new(move || {
                let handles = std::mem::take(&mut *joined.lock());
                join_pipelines(&context, handles);
            }),
        );
        match spawned {
            Ok(monitor) => *self.monitor.lock() = Some(monitor),
            Err(e) => {
                self.context
                    .control
                    .abort(FatalError::Setup(format!("failed to spawn monitor: {}", e)));
                let handles = std::mem::take(&mut *handles.lock());
                join_pipelines(&self.context, handles);
                return Err(EngineError::Spawn(e));
            }
        }

        info!(engine = %self.config.name, pipelines = pipelines, "Processing started");
        Ok(())
    }

    fn setup(&self) -> Result<(), EngineError> {
        for container in &self.context.containers {
            container.deploy()?;
        }

        let manager = &self.context.cas_manager;
        if let Some(meta) = self.context.reader.lock().reader.metadata() {
            manager.add_meta_data(&meta)?;
        }
        for container in &self.context.containers {
            if let Some(meta) = container.metadata() {
                manager.add_meta_data(&meta)?;
            }
        }
        manager.define_cas_pool(
            ENGINE_CONSUMER,
            self.config.effective_cas_pool_size(),
            self.config.cas_tuning,
        )?;
        Ok(())
    }

    /// Pauses at the next entity boundary.
    pub fn pause(&self) {
        if self.context.control.request_pause() {
            info!(engine = %self.config.name, "Pause requested");
            self.context.listeners.paused();
        }
    }

    /// Resumes a paused run, dropping any entity held by a failure pause.
    pub fn resume(&self) {
        self.resume_with(false);
    }

    /// Resumes a paused run. With `retry_failed`, entities held by a
    /// failure pause re-enter the pipeline at the first stage.
    pub fn resume_with(&self, retry_failed: bool) {
        if self.context.control.resume(retry_failed) {
            info!(engine = %self.config.name, retry_failed = retry_failed, "Resumed");
            self.context.listeners.resumed();
        }
    }

    /// Stops admitting entities. Teardown completes in the background once
    /// in-flight calls return; use [`wait`](Self::wait) to block on it.
    pub fn stop(&self) {
        if self.context.control.stop() {
            info!(engine = %self.config.name, "Stop requested");
        }
    }

    /// Blocks until a started run has finished tearing down.
    pub fn wait(&self) {
        self.context.control.wait_finished();
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }
    }

    pub fn is_processing(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    /// The fatal error that aborted the run, if any.
    pub fn last_error(&self) -> Option<FatalError> {
        self.context.control.failure()
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        self.context.report()
    }

    pub fn get_progress(&self) -> Vec<Progress> {
        self.context.progress()
    }

    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) {
        self.context.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StatusListener>) -> bool {
        self.context.listeners.remove(listener)
    }

    pub fn synch_point(&self) -> Option<SynchPoint> {
        self.context.synch_point()
    }

    /// Repositions the reader from a checkpoint file. Only valid before `process()`.
    pub fn restore_checkpoint(&self, path: &Path) -> Result<(), EngineError> {
        let state = self.state();
        if state != RunState::Idle {
            return Err(EngineError::AlreadyRunning { state });
        }
        let checkpoint = Checkpoint::load(path)?;
        match &checkpoint.synch_point {
            Some(point) => {
                self.context.reader.lock().reader.restore(point)?;
                info!(path = %path.display(), "Reader restored from checkpoint");
            }
            None => warn!(path = %path.display(), "Checkpoint has no synch point"),
        }
        Ok(())
    }

    /// Quiescently redeploys one stage.
    pub fn redeploy(&self, stage: &str) -> Result<(), EngineError> {
        let container = self
            .context
            .containers
            .iter()
            .find(|c| c.name() == stage)
            .ok_or_else(|| EngineError::UnknownStage(stage.to_string()))?;
        container.redeploy()?;
        Ok(())
    }

    pub fn containers(&self) -> &[ProcessingContainer] {
        &self.context.containers
    }

    /// The CAS manager holding the merged type system.
    pub fn cas_manager(&self) -> &CasManager {
        &self.context.cas_manager
    }
}

impl Drop for CpmEngine {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

impl std::fmt::Debug for CpmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpmEngine")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("containers", &self.context.containers.len())
            .finish()
    }
}

type Spawner = fn(String, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;

fn spawn_named(name: String, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(body)
}

fn join_pipelines(context: &PipelineContext, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            context.control.abort(FatalError::PipelinePanicked);
        }
    }
    finish_run(context);
}

/// Runs after every pipeline thread has exited.
fn finish_run(context: &PipelineContext) {
    let completed = context.control.failure().is_none() && context.control.complete();
    let elapsed = context.elapsed();
    *context.elapsed.lock() = Some(elapsed);

    if completed {
        for container in &context.containers {
            container.collection_process_complete();
        }
        info!(engine = %context.name, "Collection processing complete");
        context.listeners.collection_process_complete();
    } else {
        if let Some(failure) = context.control.failure() {
            error!(engine = %context.name, error = %failure, "Processing aborted");
        }
        context.listeners.aborted();
    }

    if let Some(writer) = &context.checkpoint {
        context.write_checkpoint(writer);
    }
    teardown(context);
    context.control.mark_finished();
}

fn teardown(context: &PipelineContext) {
    for container in &context.containers {
        container.shutdown();
    }
    context.cas_manager.close();
    if let Err(e) = context.reader.lock().reader.close() {
        warn!(error = %e, "Failed to close collection reader");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::{Cas, ProcessingResourceMetaData};
    use crate::engine::{Progress, UNIT_ENTITIES};
    use crate::error::{ProcessingError, ReaderError};
    use crate::processor::CasProcessor;
    use std::time::Duration;

    struct Countdown {
        remaining: u64,
        served: u64,
    }

    impl CollectionReader for Countdown {
        fn has_next(&mut self) -> Result<bool, ReaderError> {
            Ok(self.remaining > 0)
        }

        fn get_next(&mut self, cas: &mut Cas) -> Result<(), ReaderError> {
            self.remaining -= 1;
            self.served += 1;
            cas.set_document_id(format!("doc{}", self.served));
            Ok(())
        }

        fn progress(&self) -> Vec<Progress> {
            vec![Progress::new(self.served, None, UNIT_ENTITIES)]
        }
    }

    struct Slow;

    impl CasProcessor for Slow {
        fn process(&mut self, _cas: &mut Cas) -> Result<(), ProcessingError> {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }

        fn metadata(&self) -> ProcessingResourceMetaData {
            ProcessingResourceMetaData::named("slow")
        }
    }

    fn refuse_to_spawn(_: String, _: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        Err(io::Error::new(io::ErrorKind::OutOfMemory, "no threads left"))
    }

    #[test]
    fn test_monitor_spawn_failure_finishes_run() {
        let engine = CpmEngine::builder()
            .config(CpmConfig {
                pipelines: 2,
                parallel: true,
                ..CpmConfig::default()
            })
            .reader(Countdown {
                remaining: 1000,
                served: 0,
            })
            .integrated_stage(
                CasProcessorConfig::new("slow"),
                Arc::new(|| Ok(Box::new(Slow) as Box<dyn CasProcessor>)),
            )
            .build()
            .unwrap();

        let result = engine.start(refuse_to_spawn);
        assert!(matches!(result, Err(EngineError::Spawn(_))));

        // Returns because the pipelines were joined and the run finished
        engine.wait();
        assert_eq!(engine.state(), RunState::Stopped);
        assert!(matches!(engine.last_error(), Some(FatalError::Setup(_))));
        assert_eq!(engine.containers()[0].pool_stats().total, 0);
    }
}
