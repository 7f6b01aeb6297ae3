//! Processing containers.
//!
//! A [`ProcessingContainer`] wraps one pipeline stage: a pool of interchangeable
//! instances plus the fault policy that decides what a failed call means.
//!
//! # Health
//!
//! Each failed call increments a consecutive-failure counter; a success resets
//! it. When the counter reaches `max_consecutive_errors` the configured
//! [`ErrorAction`] applies. A disabled container is bypassed: entities pass
//! through without invoking the stage until [`redeploy`](ProcessingContainer::redeploy).
//!
//! # Restarts
//!
//! For fenced stages a connection failure (not a timeout) triggers an
//! automatic redeploy, up to `max_restarts` times per container.
//!
//! # Stalled calls
//!
//! A fenced call that times out may still be running in its worker. The
//! instance stays out of the pool until the late reply has arrived and been
//! discarded, or until a redeploy or shutdown cuts the call off. A worker
//! therefore never runs more calls than the pool has instances.
//!
//! # Redeploy
//!
//! Redeploy is a stop-the-world operation scoped to one container. It closes
//! the admission gate, suspends the pool, cuts off stalled calls, waits until
//! every instance is checked in, restarts the instances through the deployer,
//! and only then readmits checkouts. No proxy is rebound while a call is in
//! flight.

mod config;
mod stats;

pub use config::{
    CasProcessorConfig, ErrorAction, RestartAction, DEFAULT_MAX_CONSECUTIVE_ERRORS,
    DEFAULT_MAX_RESTARTS, DEFAULT_POOL_SIZE,
};
pub use stats::ContainerStatsSnapshot;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cas::{Cas, ProcessingResourceMetaData};
use crate::deployer::{CasProcessorDeployer, DeploymentKind};
use crate::engine::{ListenerSet, StatusListener};
use crate::error::{ConfigurationError, DeploymentError, FatalError, ProcessingError};
use crate::pool::{PoolError, PoolStats, ServiceProxyPool};
use crate::processor::{InvocationError, StageInstance};
use crate::transport::CallInterrupter;
use stats::ContainerStats;

/// Whether a container admits entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerHealth {
    Enabled,
    Disabled,
}

impl ContainerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ContainerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pushing one CAS through one container.
#[derive(Debug)]
pub enum StageOutcome {
    Processed,
    /// The container is disabled; the stage was not invoked.
    Skipped,
    Failed(StageFailure),
}

/// A failed stage call, already accounted for by the container.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub error: ProcessingError,
    /// Set when the container's policy aborts the whole run.
    pub fatal: Option<FatalError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Processing,
    Timeout,
    Connection,
    Checkout,
}

impl FailureKind {
    fn of(error: &InvocationError) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connection_failure() {
            Self::Connection
        } else {
            Self::Processing
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Continue,
    Disabled,
    Terminate(String),
    Redeploy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Open,
    Redeploying,
    Shutdown,
}

/// Timed-out calls whose instances are waiting for a late reply.
#[derive(Default)]
struct StalledCalls {
    next_id: AtomicU64,
    interrupters: Mutex<HashMap<u64, Option<CallInterrupter>>>,
}

impl StalledCalls {
    fn register(&self, interrupter: Option<CallInterrupter>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.interrupters.lock().insert(id, interrupter);
        id
    }

    fn complete(&self, id: u64) {
        self.interrupters.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.interrupters.lock().len()
    }

    /// Severs every stalled connection. Returns how many were cut.
    fn interrupt_all(&self) -> usize {
        let interrupters = self.interrupters.lock();
        for interrupter in interrupters.values().flatten() {
            interrupter.interrupt();
        }
        interrupters.len()
    }
}

#[derive(Debug)]
struct ContainerState {
    health: ContainerHealth,
    consecutive_errors: usize,
    restarts: usize,
    generation: u64,
    batch_counter: u64,
}

/// One pipeline stage: pooled instances plus fault policy.
pub struct ProcessingContainer {
    config: CasProcessorConfig,
    pool: Arc<ServiceProxyPool<StageInstance>>,
    stalled: Arc<StalledCalls>,
    deployer: Box<dyn CasProcessorDeployer>,
    state: Mutex<ContainerState>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    redeploy_lock: Mutex<()>,
    metadata: RwLock<Option<ProcessingResourceMetaData>>,
    stats: ContainerStats,
    listeners: Arc<ListenerSet>,
}

impl ProcessingContainer {
    /// Creates an empty container. Instances are created by [`deploy`](Self::deploy).
    pub fn new(
        config: CasProcessorConfig,
        deployer: Box<dyn CasProcessorDeployer>,
        listeners: Arc<ListenerSet>,
    ) -> Result<Self, ConfigurationError> {
        if config.pool_size == 0 {
            return Err(ConfigurationError::InvalidPoolSize {
                consumer: config.name.clone(),
                size: 0,
            });
        }
        Ok(Self {
            pool: Arc::new(ServiceProxyPool::new(config.name.clone())),
            stalled: Arc::default(),
            config,
            deployer,
            state: Mutex::new(ContainerState {
                health: ContainerHealth::Enabled,
                consecutive_errors: 0,
                restarts: 0,
                generation: 0,
                batch_counter: 0,
            }),
            gate: Mutex::new(Gate::Open),
            gate_changed: Condvar::new(),
            redeploy_lock: Mutex::new(()),
            metadata: RwLock::new(None),
            stats: ContainerStats::default(),
            listeners,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CasProcessorConfig {
        &self.config
    }

    pub fn deployment(&self) -> DeploymentKind {
        self.deployer.kind()
    }

    pub fn health(&self) -> ContainerHealth {
        self.state.lock().health
    }

    pub fn is_enabled(&self) -> bool {
        self.health() == ContainerHealth::Enabled
    }

    pub fn consecutive_errors(&self) -> usize {
        self.state.lock().consecutive_errors
    }

    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    /// Incremented by every successful redeploy.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn stats(&self) -> ContainerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Instances held back while a timed-out call finishes in its worker.
    pub fn stalled_calls(&self) -> usize {
        self.stalled.len()
    }

    /// Metadata reported by the first deployed instance.
    pub fn metadata(&self) -> Option<ProcessingResourceMetaData> {
        self.metadata.read().clone()
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    /// Creates `pool_size` instances, retrying up to `max_restarts` times.
    ///
    /// When every attempt fails the restart action decides: `disable` leaves
    /// the container disabled and returns `Ok`, `terminate` returns the error.
    pub fn deploy(&self) -> Result<(), DeploymentError> {
        let attempts = self.config.max_restarts + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.deployer.deploy(self.config.pool_size) {
                Ok(mut instances) => {
                    self.capture_metadata(&mut instances);
                    for instance in instances {
                        self.pool.add(instance);
                    }
                    info!(
                        container = %self.config.name,
                        deployment = %self.deployer.kind(),
                        instances = self.config.pool_size,
                        "Container deployed"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        container = %self.config.name,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "Deployment attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| DeploymentError::Closed(self.config.name.clone()));
        match self.config.action_on_max_restarts {
            RestartAction::Disable => {
                self.disable();
                Ok(())
            }
            RestartAction::Terminate => Err(error),
        }
    }

    fn capture_metadata(&self, instances: &mut [StageInstance]) {
        let Some(first) = instances.first_mut() else {
            return;
        };
        let metadata = match first.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(container = %self.config.name, error = %e, "Failed to fetch metadata");
                ProcessingResourceMetaData::named(self.config.name.clone())
            }
        };
        *self.metadata.write() = Some(metadata);
    }

    /// Restarts every instance once none is in use.
    ///
    /// Blocks new checkouts, waits for in-flight calls to check their
    /// instances in, restarts them through the deployer and readmits
    /// checkouts. A disabled container is re-enabled on success. Must not be
    /// called while holding a lease from this container.
    pub fn redeploy(&self) -> Result<(), DeploymentError> {
        let result = self.redeploy_if(None);
        if result.is_ok() {
            self.state.lock().restarts = 0;
        }
        result
    }

    /// Redeploys unless another thread already did since `generation`.
    fn redeploy_if(&self, generation: Option<u64>) -> Result<(), DeploymentError> {
        let _serial = self.redeploy_lock.lock();
        if let Some(expected) = generation {
            if self.state.lock().generation != expected {
                debug!(container = %self.config.name, "Redeploy already performed");
                return Ok(());
            }
        }

        {
            let mut gate = self.gate.lock();
            if *gate == Gate::Shutdown {
                return Err(DeploymentError::Closed(self.config.name.clone()));
            }
            *gate = Gate::Redeploying;
        }
        self.pool.suspend();

        let stalled = self.stalled.interrupt_all();
        info!(
            container = %self.config.name,
            in_flight = self.pool.checked_out(),
            stalled = stalled,
            "Redeploy waiting for in-flight calls"
        );

        // Empty only when the container never deployed
        let mut instances = self.pool.wait_quiescent_and_drain();
        let result = if instances.is_empty() {
            self.deployer
                .deploy(self.config.pool_size)
                .map(|fresh| instances = fresh)
        } else {
            self.deployer.redeploy(&mut instances)
        };
        if result.is_ok() {
            self.capture_metadata(&mut instances);
        }
        for instance in instances {
            self.pool.add(instance);
        }

        if result.is_ok() {
            let mut state = self.state.lock();
            state.generation += 1;
            state.consecutive_errors = 0;
            state.health = ContainerHealth::Enabled;
            drop(state);
            self.stats.record_restart();
            info!(container = %self.config.name, "Container redeployed");
        }
        self.pool.resume();

        {
            let mut gate = self.gate.lock();
            if *gate == Gate::Redeploying {
                *gate = Gate::Open;
            }
        }
        self.gate_changed.notify_all();
        result
    }

    // =========================================================================
    // Checkout / checkin
    // =========================================================================

    /// Checks out an instance.
    ///
    /// Returns `Ok(None)` when the container is disabled. A checkout timeout
    /// counts as a failure against the container's health.
    pub fn get_cas_processor(&self) -> Result<Option<ProcessorLease<'_>>, DeploymentError> {
        self.acquire().map_err(|(error, _)| error)
    }

    /// Checks an instance back in and records the call's outcome.
    ///
    /// A failure is routed through the container's policy; the returned error
    /// is set when that policy aborts the whole run.
    pub fn release_cas_processor(
        &self,
        mut lease: ProcessorLease<'_>,
        success: bool,
    ) -> Option<FatalError> {
        let generation = lease.generation;
        if let Some(instance) = lease.instance.take() {
            self.return_instance(instance);
        }
        if success {
            self.record_success();
            return None;
        }
        self.stats.record_failure(false);
        let verdict = self.record_failure(FailureKind::Processing, generation);
        self.apply(verdict, Some(generation))
    }

    /// Checks `instance` in, or parks it first if its call stalled.
    fn return_instance(&self, instance: StageInstance) {
        if instance.is_stalled() {
            self.park(instance);
        } else {
            self.pool.check_in(instance);
        }
    }

    /// Keeps a stalled instance out of the pool until its late reply has been
    /// drained or the call is cut off.
    fn park(&self, instance: StageInstance) {
        let id = self.stalled.register(instance.interrupter());
        let slot = Arc::new(Mutex::new(Some(instance)));

        let waiter_slot = Arc::clone(&slot);
        let pool = Arc::clone(&self.pool);
        let stalled = Arc::clone(&self.stalled);
        let name = self.config.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("cpe-stalled-{}", self.config.name))
            .spawn(move || {
                let Some(mut instance) = waiter_slot.lock().take() else {
                    return;
                };
                if let Err(e) = instance.await_late_reply() {
                    debug!(container = %name, error = %e, "Stalled call cut off");
                }
                stalled.complete(id);
                pool.check_in(instance);
            });

        if let Err(e) = spawned {
            warn!(
                container = %self.config.name,
                error = %e,
                "Cannot wait for stalled call; severing it"
            );
            if let Some(mut instance) = slot.lock().take() {
                if let Some(interrupter) = instance.interrupter() {
                    interrupter.interrupt();
                }
                let _ = instance.await_late_reply();
                self.stalled.complete(id);
                self.pool.check_in(instance);
            }
        }
    }

    fn acquire(&self) -> Result<Option<ProcessorLease<'_>>, (DeploymentError, Verdict)> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.wait_for_gate()
            .map_err(|e| (e, Verdict::Continue))?;

        let checkout = match self.config.checkout_timeout {
            Some(timeout) => self.pool.check_out_timeout(timeout),
            None => self.pool.check_out(),
        };

        match checkout {
            Ok(instance) => {
                let generation = self.generation();
                if !self.is_enabled() {
                    self.pool.check_in(instance);
                    return Ok(None);
                }
                Ok(Some(ProcessorLease {
                    container: self,
                    instance: Some(instance),
                    generation,
                }))
            }
            Err(PoolError::Timeout) => {
                let timeout = self.config.checkout_timeout.unwrap_or_default();
                self.stats.record_failure(false);
                let verdict = self.record_failure(FailureKind::Checkout, self.generation());
                Err((
                    DeploymentError::CheckoutTimeout {
                        container: self.config.name.clone(),
                        timeout,
                    },
                    verdict,
                ))
            }
            Err(PoolError::Closed) => Err((
                DeploymentError::Closed(self.config.name.clone()),
                Verdict::Continue,
            )),
        }
    }

    fn wait_for_gate(&self) -> Result<(), DeploymentError> {
        let mut gate = self.gate.lock();
        loop {
            match *gate {
                Gate::Open => return Ok(()),
                Gate::Shutdown => return Err(DeploymentError::Closed(self.config.name.clone())),
                Gate::Redeploying => self.gate_changed.wait(&mut gate),
            }
        }
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Runs the stage on `cas`, applying the container's fault policy.
    ///
    /// Failures never propagate as errors; they are reported in the outcome
    /// after the container has accounted for them.
    pub fn process_cas(&self, cas: &mut Cas) -> StageOutcome {
        let mut lease = match self.acquire() {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                self.stats.record_skip();
                return StageOutcome::Skipped;
            }
            Err((error, verdict)) => {
                let error = ProcessingError::new(self.config.name.clone(), error.to_string());
                return StageOutcome::Failed(self.resolve(error, verdict, None));
            }
        };

        let generation = lease.generation;
        let start = Instant::now();
        let result = lease.process(cas);
        let traffic = lease.take_traffic();
        self.stats.record_call(start.elapsed(), traffic);

        match result {
            Ok(()) => {
                self.complete_batch(&mut lease);
                self.release_cas_processor(lease, true);
                StageOutcome::Processed
            }
            Err(e) => {
                if let Some(instance) = lease.instance.take() {
                    self.return_instance(instance);
                }
                drop(lease);

                let kind = FailureKind::of(&e);
                self.stats.record_failure(kind == FailureKind::Timeout);
                let verdict = self.record_failure(kind, generation);
                let error = e.into_processing_error(&self.config.name);
                warn!(
                    container = %self.config.name,
                    error = %error.message,
                    kind = ?kind,
                    "Stage call failed"
                );
                StageOutcome::Failed(self.resolve(error, verdict, Some(generation)))
            }
        }
    }

    fn resolve(&self, error: ProcessingError, verdict: Verdict, generation: Option<u64>) -> StageFailure {
        let fatal = self.apply(verdict, generation);
        StageFailure { error, fatal }
    }

    /// Carries out a verdict. Returns the error that aborts the run, if any.
    fn apply(&self, verdict: Verdict, generation: Option<u64>) -> Option<FatalError> {
        match verdict {
            Verdict::Continue | Verdict::Disabled => None,
            Verdict::Terminate(reason) => Some(FatalError::StageTerminated {
                container: self.config.name.clone(),
                reason,
            }),
            Verdict::Redeploy => match self.redeploy_if(generation) {
                Ok(()) => None,
                Err(e) => {
                    warn!(container = %self.config.name, error = %e, "Automatic redeploy failed");
                    match self.config.action_on_max_restarts {
                        RestartAction::Disable => {
                            self.disable();
                            None
                        }
                        RestartAction::Terminate => Some(FatalError::Deployment {
                            container: self.config.name.clone(),
                            reason: e.to_string(),
                        }),
                    }
                }
            },
        }
    }

    fn complete_batch(&self, lease: &mut ProcessorLease<'_>) {
        if self.config.batch_size == 0 {
            return;
        }
        let complete = {
            let mut state = self.state.lock();
            state.batch_counter += 1;
            state.batch_counter % self.config.batch_size as u64 == 0
        };
        if complete {
            self.stats.record_batch();
            if let Err(e) = lease.batch_process_complete() {
                warn!(container = %self.config.name, error = %e, "Batch completion failed");
            }
        }
    }

    fn record_success(&self) {
        self.stats.record_success();
        self.state.lock().consecutive_errors = 0;
    }

    fn record_failure(&self, kind: FailureKind, generation: u64) -> Verdict {
        let mut state = self.state.lock();
        if state.health == ContainerHealth::Disabled {
            return Verdict::Continue;
        }
        state.consecutive_errors += 1;

        let max = self.config.max_consecutive_errors;
        if max > 0 && state.consecutive_errors >= max {
            match self.config.action_on_max_errors {
                ErrorAction::Disable => {
                    drop(state);
                    self.disable();
                    return Verdict::Disabled;
                }
                ErrorAction::Terminate => {
                    return Verdict::Terminate(format!(
                        "{} consecutive errors",
                        state.consecutive_errors
                    ));
                }
                ErrorAction::Continue => state.consecutive_errors = 0,
            }
        }

        if kind == FailureKind::Connection && self.deployer.kind() == DeploymentKind::Fenced {
            if generation != state.generation {
                return Verdict::Continue;
            }
            if state.restarts < self.config.max_restarts {
                state.restarts += 1;
                return Verdict::Redeploy;
            }
            return match self.config.action_on_max_restarts {
                RestartAction::Disable => {
                    drop(state);
                    self.disable();
                    Verdict::Disabled
                }
                RestartAction::Terminate => Verdict::Terminate(format!(
                    "restart budget of {} exhausted",
                    self.config.max_restarts
                )),
            };
        }
        Verdict::Continue
    }

    /// Flips to Disabled, firing `processor_disabled` on the transition only.
    fn disable(&self) {
        {
            let mut state = self.state.lock();
            if state.health == ContainerHealth::Disabled {
                return;
            }
            state.health = ContainerHealth::Disabled;
        }
        warn!(container = %self.config.name, "Container disabled");
        self.listeners.processor_disabled(&self.config.name);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delivers end-of-collection to every instance.
    ///
    /// Stalled calls are cut off first; their results would be discarded.
    pub fn collection_process_complete(&self) {
        self.pool.suspend();
        self.stalled.interrupt_all();
        let mut instances = self.pool.wait_quiescent_and_drain();
        for instance in &mut instances {
            if let Err(e) = instance.collection_process_complete() {
                warn!(container = %self.config.name, error = %e, "Collection completion failed");
            }
        }
        for instance in instances {
            self.pool.add(instance);
        }
        self.pool.resume();
    }

    /// Stops admitting work, releases all instances and undeploys workers.
    pub fn shutdown(&self) {
        {
            let mut gate = self.gate.lock();
            if *gate == Gate::Shutdown {
                return;
            }
            *gate = Gate::Shutdown;
        }
        self.gate_changed.notify_all();
        self.pool.close();
        self.stalled.interrupt_all();

        if !self.pool.wait_quiescent_timeout(self.config.call_timeout) {
            warn!(
                container = %self.config.name,
                in_flight = self.pool.checked_out(),
                "Shutting down with calls still in flight"
            );
        }
        drop(self.pool.drain());

        if let Err(e) = self.deployer.undeploy() {
            warn!(container = %self.config.name, error = %e, "Undeploy failed");
        }
        debug!(container = %self.config.name, "Container shut down");
    }
}

impl fmt::Debug for ProcessingContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContainer")
            .field("name", &self.config.name)
            .field("deployment", &self.deployer.kind())
            .field("health", &self.health())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Exclusive use of one stage instance.
///
/// Dropping a lease without releasing it checks the instance back in without
/// recording an outcome.
pub struct ProcessorLease<'a> {
    container: &'a ProcessingContainer,
    instance: Option<StageInstance>,
    generation: u64,
}

impl ProcessorLease<'_> {
    /// Container generation at checkout time.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ProcessorLease<'_> {
    type Target = StageInstance;

    fn deref(&self) -> &StageInstance {
        // Only release and drop take the instance out.
        self.instance.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for ProcessorLease<'_> {
    fn deref_mut(&mut self) -> &mut StageInstance {
        self.instance.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ProcessorLease<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.container.return_instance(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::IntegratedDeployer;
    use crate::processor::{CasProcessor, ProcessorFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Scripted {
        fail: Arc<std::sync::atomic::AtomicBool>,
        calls: Arc<AtomicUsize>,
        batches: Arc<AtomicUsize>,
    }

    impl CasProcessor for Scripted {
        fn process(&mut self, _cas: &mut Cas) -> Result<(), ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(ProcessingError::new("scripted", "scripted failure"))
            } else {
                Ok(())
            }
        }

        fn metadata(&self) -> ProcessingResourceMetaData {
            ProcessingResourceMetaData::named("scripted")
        }

        fn batch_process_complete(&mut self) -> Result<(), ProcessingError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Stub {
        fail: Arc<std::sync::atomic::AtomicBool>,
        calls: Arc<AtomicUsize>,
        batches: Arc<AtomicUsize>,
    }

    impl Stub {
        fn new() -> Self {
            Self {
                fail: Arc::default(),
                calls: Arc::default(),
                batches: Arc::default(),
            }
        }

        fn factory(&self) -> ProcessorFactory {
            let fail = Arc::clone(&self.fail);
            let calls = Arc::clone(&self.calls);
            let batches = Arc::clone(&self.batches);
            Arc::new(move || {
                Ok(Box::new(Scripted {
                    fail: Arc::clone(&fail),
                    calls: Arc::clone(&calls),
                    batches: Arc::clone(&batches),
                }) as Box<dyn CasProcessor>)
            })
        }

        fn container(&self, config: CasProcessorConfig) -> ProcessingContainer {
            let deployer = IntegratedDeployer::new(config.name.clone(), self.factory());
            let container =
                ProcessingContainer::new(config, Box::new(deployer), Arc::new(ListenerSet::new()))
                    .unwrap();
            container.deploy().unwrap();
            container
        }
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let stub = Stub::new();
        let deployer = IntegratedDeployer::new("s", stub.factory());
        let result = ProcessingContainer::new(
            CasProcessorConfig::new("s").with_pool_size(0),
            Box::new(deployer),
            Arc::new(ListenerSet::new()),
        );
        assert!(matches!(result, Err(ConfigurationError::InvalidPoolSize { .. })));
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_max_consecutive_errors(3));

        stub.fail.store(true, Ordering::SeqCst);
        let mut cas = Cas::new();
        assert!(matches!(container.process_cas(&mut cas), StageOutcome::Failed(_)));
        assert!(matches!(container.process_cas(&mut cas), StageOutcome::Failed(_)));
        assert_eq!(container.consecutive_errors(), 2);

        stub.fail.store(false, Ordering::SeqCst);
        assert!(matches!(container.process_cas(&mut cas), StageOutcome::Processed));
        assert_eq!(container.consecutive_errors(), 0);
        assert!(container.is_enabled());
    }

    #[test]
    fn test_terminate_action_marks_failure_fatal() {
        let stub = Stub::new();
        let container = stub.container(
            CasProcessorConfig::new("s")
                .with_max_consecutive_errors(2)
                .with_action_on_max_errors(ErrorAction::Terminate),
        );
        stub.fail.store(true, Ordering::SeqCst);

        let mut cas = Cas::new();
        match container.process_cas(&mut cas) {
            StageOutcome::Failed(failure) => assert!(failure.fatal.is_none()),
            other => panic!("unexpected outcome {:?}", other),
        }
        match container.process_cas(&mut cas) {
            StageOutcome::Failed(failure) => assert!(matches!(
                failure.fatal,
                Some(FatalError::StageTerminated { .. })
            )),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_continue_action_never_disables() {
        let stub = Stub::new();
        let container = stub.container(
            CasProcessorConfig::new("s")
                .with_max_consecutive_errors(1)
                .with_action_on_max_errors(ErrorAction::Continue),
        );
        stub.fail.store(true, Ordering::SeqCst);

        let mut cas = Cas::new();
        for _ in 0..5 {
            assert!(matches!(container.process_cas(&mut cas), StageOutcome::Failed(_)));
        }
        assert!(container.is_enabled());
        assert_eq!(container.stats().failed, 5);
    }

    #[test]
    fn test_checkout_timeout_counts_against_health() {
        let stub = Stub::new();
        let container = stub.container(
            CasProcessorConfig::new("s")
                .with_max_consecutive_errors(1)
                .with_checkout_timeout(Duration::from_millis(20)),
        );

        let held = container.get_cas_processor().unwrap().unwrap();
        let result = container.get_cas_processor();
        assert!(matches!(result, Err(DeploymentError::CheckoutTimeout { .. })));
        assert_eq!(container.health(), ContainerHealth::Disabled);

        container.release_cas_processor(held, true);
        assert!(container.get_cas_processor().unwrap().is_none());
    }

    #[test]
    fn test_batch_completion_reaches_instance() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_batch_size(2));

        let mut cas = Cas::new();
        for _ in 0..5 {
            container.process_cas(&mut cas);
        }
        assert_eq!(stub.batches.load(Ordering::SeqCst), 2);
        assert_eq!(container.stats().batches, 2);
    }

    #[test]
    fn test_redeploy_re_enables_disabled_container() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_max_consecutive_errors(1));

        stub.fail.store(true, Ordering::SeqCst);
        container.process_cas(&mut Cas::new());
        assert_eq!(container.health(), ContainerHealth::Disabled);
        assert!(matches!(container.process_cas(&mut Cas::new()), StageOutcome::Skipped));

        stub.fail.store(false, Ordering::SeqCst);
        container.redeploy().unwrap();
        assert!(container.is_enabled());
        assert_eq!(container.generation(), 1);
        assert!(matches!(container.process_cas(&mut Cas::new()), StageOutcome::Processed));
        assert_eq!(container.stats().skipped, 1);
    }

    #[test]
    fn test_redeploy_completes_after_every_checkin() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_pool_size(2));

        let a = container.get_cas_processor().unwrap().unwrap();
        let b = container.get_cas_processor().unwrap().unwrap();

        let (checkins, redeployed) = std::thread::scope(|scope| {
            let redeploy = scope.spawn(|| {
                container.redeploy().unwrap();
                Instant::now()
            });

            std::thread::sleep(Duration::from_millis(30));
            container.release_cas_processor(a, true);
            let first = Instant::now();
            std::thread::sleep(Duration::from_millis(30));
            container.release_cas_processor(b, true);
            let second = Instant::now();

            (vec![first, second], redeploy.join().unwrap())
        });

        assert!(checkins.iter().all(|checkin| redeployed >= *checkin));
        assert_eq!(container.generation(), 1);
        assert_eq!(container.pool_stats().free, 2);
    }

    #[test]
    fn test_parked_checkouts_wait_out_redeploy() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s"));
        let held = container.get_cas_processor().unwrap().unwrap();

        let shared = &container;
        let generations = std::thread::scope(|scope| {
            // Past the gate and blocked on the empty pool before redeploy starts
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    scope.spawn(move || {
                        let container = shared;
                        let lease = container.get_cas_processor().unwrap().unwrap();
                        let generation = lease.generation();
                        container.release_cas_processor(lease, true);
                        generation
                    })
                })
                .collect();
            std::thread::sleep(Duration::from_millis(30));

            let redeploy = scope.spawn(|| container.redeploy());
            std::thread::sleep(Duration::from_millis(30));
            container.release_cas_processor(held, true);

            redeploy.join().unwrap().unwrap();
            waiters
                .into_iter()
                .map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(generations, vec![1, 1, 1]);
        assert_eq!(container.generation(), 1);
        assert_eq!(container.pool_stats().total, 1);
        assert_eq!(container.pool_stats().free, 1);
    }

    #[test]
    fn test_release_applies_terminate_action() {
        let stub = Stub::new();
        let container = stub.container(
            CasProcessorConfig::new("s")
                .with_max_consecutive_errors(2)
                .with_action_on_max_errors(ErrorAction::Terminate),
        );

        let lease = container.get_cas_processor().unwrap().unwrap();
        assert!(container.release_cas_processor(lease, false).is_none());

        let lease = container.get_cas_processor().unwrap().unwrap();
        assert!(matches!(
            container.release_cas_processor(lease, false),
            Some(FatalError::StageTerminated { .. })
        ));
        assert_eq!(container.stats().failed, 2);
        assert_eq!(container.pool_stats().free, 1);
    }

    #[test]
    fn test_release_applies_disable_action() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_max_consecutive_errors(1));

        let lease = container.get_cas_processor().unwrap().unwrap();
        assert!(container.release_cas_processor(lease, false).is_none());
        assert_eq!(container.health(), ContainerHealth::Disabled);
        assert!(container.get_cas_processor().unwrap().is_none());
    }

    #[test]
    fn test_dropped_lease_returns_instance() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s").with_pool_size(2));

        {
            let _a = container.get_cas_processor().unwrap().unwrap();
            let _b = container.get_cas_processor().unwrap().unwrap();
            assert_eq!(container.pool_stats().free, 0);
        }
        assert_eq!(container.pool_stats().free, 2);
    }

    #[test]
    fn test_shutdown_rejects_checkouts() {
        let stub = Stub::new();
        let container = stub.container(CasProcessorConfig::new("s"));
        container.shutdown();
        assert!(matches!(
            container.get_cas_processor(),
            Err(DeploymentError::Closed(_))
        ));
        assert_eq!(container.pool_stats().total, 0);
    }

    #[test]
    fn test_deploy_failure_with_disable_action() {
        let factory: ProcessorFactory = Arc::new(|| Err(ProcessingError::new("x", "unavailable")));
        let deployer = IntegratedDeployer::new("s", factory);
        let container = ProcessingContainer::new(
            CasProcessorConfig::new("s")
                .with_max_restarts(1)
                .with_action_on_max_restarts(RestartAction::Disable),
            Box::new(deployer),
            Arc::new(ListenerSet::new()),
        )
        .unwrap();

        container.deploy().unwrap();
        assert_eq!(container.health(), ContainerHealth::Disabled);
    }

    #[test]
    fn test_deploy_failure_with_terminate_action() {
        let factory: ProcessorFactory = Arc::new(|| Err(ProcessingError::new("x", "unavailable")));
        let deployer = IntegratedDeployer::new("s", factory);
        let container = ProcessingContainer::new(
            CasProcessorConfig::new("s").with_max_restarts(0),
            Box::new(deployer),
            Arc::new(ListenerSet::new()),
        )
        .unwrap();

        assert!(matches!(container.deploy(), Err(DeploymentError::Launch { .. })));
    }
}
