//! Bounded blocking pool of interchangeable instances.
//!
//! [`ServiceProxyPool`] holds the instances of one pipeline stage (and, through
//! the CAS manager, the reusable CAS instances). Callers check an instance out,
//! use it exclusively, and check it back in.
//!
//! # Invariants
//!
//! - `checked_out + free == total` at every observable instant
//! - an instance returned by [`check_out`](ServiceProxyPool::check_out) is never
//!   handed out again before the matching [`check_in`](ServiceProxyPool::check_in)
//! - each `check_in` wakes exactly one waiting `check_out`
//!
//! All mutations go through one pool-wide lock. Waiting uses condition
//! variables; nothing polls.
//!
//! # Quiescence
//!
//! [`wait_quiescent`](ServiceProxyPool::wait_quiescent) blocks until every
//! instance is back in the pool. Redeploy first [`suspend`](ServiceProxyPool::suspend)s
//! the pool so that blocked checkouts cannot take an instance, then uses
//! [`wait_quiescent_and_drain`](ServiceProxyPool::wait_quiescent_and_drain) as a
//! counting barrier that hands back every instance under one lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Reasons a checkout can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool is closed")]
    Closed,

    #[error("timed out waiting for a free instance")]
    Timeout,
}

/// Point-in-time view of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub checked_out: usize,
    pub peak_checked_out: usize,
}

struct PoolState<T> {
    free: VecDeque<T>,
    total: usize,
    closed: bool,
    suspended: bool,
}

impl<T> PoolState<T> {
    fn checked_out(&self) -> usize {
        self.total - self.free.len()
    }

    fn is_quiescent(&self) -> bool {
        self.free.len() == self.total
    }

    fn take(&mut self) -> Option<T> {
        if self.suspended {
            return None;
        }
        self.free.pop_front()
    }
}

/// A bounded pool with blocking checkout and notify-one checkin.
pub struct ServiceProxyPool<T> {
    name: String,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    quiescent: Condvar,
    peak_checked_out: AtomicUsize,
}

impl<T> ServiceProxyPool<T> {
    /// Creates an empty pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                total: 0,
                closed: false,
                suspended: false,
            }),
            available: Condvar::new(),
            quiescent: Condvar::new(),
            peak_checked_out: AtomicUsize::new(0),
        }
    }

    /// Creates a pool pre-filled with `instances`.
    pub fn with_instances(name: impl Into<String>, instances: impl IntoIterator<Item = T>) -> Self {
        let pool = Self::new(name);
        for instance in instances {
            pool.add(instance);
        }
        pool
    }

    /// Pool name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a new instance, growing `total` by one.
    pub fn add(&self, instance: T) {
        let mut state = self.state.lock();
        state.free.push_back(instance);
        state.total += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Removes and returns one free instance, blocking while none is free
    /// or the pool is suspended.
    ///
    /// Returns [`PoolError::Closed`] once the pool is closed.
    pub fn check_out(&self) -> Result<T, PoolError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(instance) = state.take() {
                self.update_peak(state.checked_out());
                return Ok(instance);
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`check_out`](Self::check_out), giving up after `timeout`.
    pub fn check_out_timeout(&self, timeout: Duration) -> Result<T, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(instance) = state.take() {
                self.update_peak(state.checked_out());
                return Ok(instance);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                // A checkin may have raced the deadline.
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let instance = state.take().ok_or(PoolError::Timeout)?;
                self.update_peak(state.checked_out());
                return Ok(instance);
            }
        }
    }

    /// Takes a free instance if one is available, without blocking.
    pub fn try_check_out(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let instance = state.take()?;
        self.update_peak(state.checked_out());
        Some(instance)
    }

    /// Returns an instance to the pool and wakes one waiter.
    ///
    /// Instances returned after [`close`](Self::close) are kept so that
    /// [`drain`](Self::drain) can release them.
    pub fn check_in(&self, instance: T) {
        let mut state = self.state.lock();
        debug_assert!(
            state.free.len() < state.total,
            "check_in without a matching check_out"
        );
        state.free.push_back(instance);
        let quiescent = state.is_quiescent();
        drop(state);

        self.available.notify_one();
        if quiescent {
            self.quiescent.notify_all();
        }
    }

    /// Number of currently free instances.
    pub fn size(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Number of instances owned by the pool, free or checked out.
    pub fn total_count(&self) -> usize {
        self.state.lock().total
    }

    /// Number of instances currently checked out.
    pub fn checked_out(&self) -> usize {
        self.state.lock().checked_out()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Stops handing out instances until [`resume`](Self::resume).
    ///
    /// Check-ins are still accepted; blocked checkouts keep waiting.
    pub fn suspend(&self) {
        self.state.lock().suspended = true;
    }

    /// Lifts a [`suspend`](Self::suspend) and wakes every waiter.
    pub fn resume(&self) {
        self.state.lock().suspended = false;
        self.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.total,
            free: state.free.len(),
            checked_out: state.checked_out(),
            peak_checked_out: self.peak_checked_out.load(Ordering::Relaxed),
        }
    }

    /// Blocks until every instance has been checked in.
    pub fn wait_quiescent(&self) {
        let mut state = self.state.lock();
        while !state.is_quiescent() {
            self.quiescent.wait(&mut state);
        }
    }

    /// Waits for quiescence and removes every instance without releasing
    /// the lock in between.
    ///
    /// On return the pool is empty and owns nothing, so the caller holds every
    /// instance the pool had. Pair with [`suspend`](Self::suspend): otherwise
    /// a waiter woken by the final check-in may still win the race for the lock.
    pub fn wait_quiescent_and_drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        while !state.is_quiescent() {
            self.quiescent.wait(&mut state);
        }
        let drained: Vec<T> = state.free.drain(..).collect();
        state.total = 0;
        drained
    }

    /// Like [`wait_quiescent`](Self::wait_quiescent) with a bound.
    ///
    /// Returns `true` if the pool became quiescent before `timeout` elapsed.
    pub fn wait_quiescent_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_quiescent() {
            if self.quiescent.wait_until(&mut state, deadline).timed_out() {
                return state.is_quiescent();
            }
        }
        true
    }

    /// Removes every free instance and shrinks `total` accordingly.
    ///
    /// Checked-out instances are unaffected; callers that need all of them
    /// wait for quiescence first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let drained: Vec<T> = state.free.drain(..).collect();
        state.total -= drained.len();
        drained
    }

    /// Stops handing out instances and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
        self.quiescent.notify_all();
    }

    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_checked_out.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_checked_out.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }
}

impl<T> fmt::Debug for ServiceProxyPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("ServiceProxyPool")
            .field("name", &self.name)
            .field("total", &stats.total)
            .field("free", &stats.free)
            .finish()
    }
}
