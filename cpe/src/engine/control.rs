//! Run-state coordination between the facade and pipeline threads.
//!
//! All transitions happen under one mutex; pipeline threads park on the
//! condition variable at entity boundaries while the run is paused.

use parking_lot::{Condvar, Mutex};

use super::state::RunState;
use crate::error::FatalError;

/// How a pipeline holding a failed entity continues after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeDecision {
    /// Re-run the held entity from the first stage.
    Retry,
    /// Drop the held entity and read the next one.
    Skip,
    /// The run ended while paused.
    Stop,
}

#[derive(Debug)]
struct ControlState {
    state: RunState,
    /// Bumped by every resume so waiters can tell resumes apart.
    resume_epoch: u64,
    retry_failed: bool,
    failure: Option<FatalError>,
    launched: bool,
    finished: bool,
}

#[derive(Debug)]
pub(crate) struct RunControl {
    inner: Mutex<ControlState>,
    changed: Condvar,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ControlState {
                state: RunState::Idle,
                resume_epoch: 0,
                retry_failed: false,
                failure: None,
                launched: false,
                finished: false,
            }),
            changed: Condvar::new(),
        }
    }
}

impl RunControl {
    pub fn state(&self) -> RunState {
        self.inner.lock().state
    }

    pub fn failure(&self) -> Option<FatalError> {
        self.inner.lock().failure.clone()
    }

    /// Idle -> Running. Returns the current state on refusal.
    pub fn try_start(&self) -> Result<(), RunState> {
        let mut inner = self.inner.lock();
        if inner.state != RunState::Idle {
            return Err(inner.state);
        }
        inner.state = RunState::Running;
        inner.launched = true;
        Ok(())
    }

    /// Running -> Paused. Returns whether the transition happened.
    pub fn request_pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != RunState::Running {
            return false;
        }
        inner.state = RunState::Paused;
        true
    }

    /// Paused -> Running, releasing every parked pipeline.
    pub fn resume(&self, retry_failed: bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != RunState::Paused {
            return false;
        }
        inner.state = RunState::Running;
        inner.resume_epoch += 1;
        inner.retry_failed = retry_failed;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Running/Paused -> Stopped.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return false;
        }
        inner.state = RunState::Stopped;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Running/Paused -> Completed.
    pub fn complete(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.is_active() {
            return false;
        }
        inner.state = RunState::Completed;
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Stops the run, keeping the first fatal error.
    pub fn abort(&self, error: FatalError) {
        let mut inner = self.inner.lock();
        if inner.failure.is_none() {
            inner.failure = Some(error);
        }
        if !inner.state.is_terminal() {
            inner.state = RunState::Stopped;
        }
        drop(inner);
        self.changed.notify_all();
    }

    /// Parks while paused. Returns `false` once the run has ended.
    pub fn wait_at_boundary(&self) -> bool {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                RunState::Running => return true,
                RunState::Paused => self.changed.wait(&mut inner),
                _ => return false,
            }
        }
    }

    /// Pauses on behalf of a pipeline holding a failed entity.
    ///
    /// Returns the epoch to pass to [`await_resume`](Self::await_resume) and
    /// whether this call performed the transition, or `None` when the run has
    /// already ended.
    pub fn enter_failure_pause(&self) -> Option<(u64, bool)> {
        let mut inner = self.inner.lock();
        match inner.state {
            RunState::Running => {
                inner.state = RunState::Paused;
                Some((inner.resume_epoch, true))
            }
            RunState::Paused => Some((inner.resume_epoch, false)),
            _ => None,
        }
    }

    pub fn await_resume(&self, epoch: u64) -> ResumeDecision {
        let mut inner = self.inner.lock();
        loop {
            if inner.state.is_terminal() {
                return ResumeDecision::Stop;
            }
            if inner.resume_epoch != epoch {
                return if inner.retry_failed {
                    ResumeDecision::Retry
                } else {
                    ResumeDecision::Skip
                };
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Teardown done; releases [`wait_finished`](Self::wait_finished).
    pub fn mark_finished(&self) {
        self.inner.lock().finished = true;
        self.changed.notify_all();
    }

    /// Blocks until a launched run has been torn down.
    pub fn wait_finished(&self) {
        let mut inner = self.inner.lock();
        while inner.launched && !inner.finished {
            self.changed.wait(&mut inner);
        }
    }

    pub fn is_finished(&self) -> bool {
        let inner = self.inner.lock();
        inner.launched && inner.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lifecycle_transitions() {
        let control = RunControl::default();
        assert!(!control.request_pause());
        control.try_start().unwrap();
        assert_eq!(control.try_start(), Err(RunState::Running));

        assert!(control.request_pause());
        assert!(!control.request_pause());
        assert!(control.resume(false));
        assert!(control.stop());
        assert!(!control.resume(true));
        assert_eq!(control.state(), RunState::Stopped);
    }

    #[test]
    fn test_boundary_wait_released_by_resume() {
        let control = Arc::new(RunControl::default());
        control.try_start().unwrap();
        control.request_pause();

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.wait_at_boundary())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());

        control.resume(false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_failure_pause_decisions() {
        let control = Arc::new(RunControl::default());
        control.try_start().unwrap();

        let (epoch, transitioned) = control.enter_failure_pause().unwrap();
        assert!(transitioned);
        let (same_epoch, second) = control.enter_failure_pause().unwrap();
        assert_eq!(epoch, same_epoch);
        assert!(!second);

        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.await_resume(epoch))
        };
        control.resume(true);
        assert_eq!(waiter.join().unwrap(), ResumeDecision::Retry);

        let (epoch, _) = control.enter_failure_pause().unwrap();
        control.stop();
        assert_eq!(control.await_resume(epoch), ResumeDecision::Stop);
        assert!(control.enter_failure_pause().is_none());
    }

    #[test]
    fn test_abort_keeps_first_error() {
        let control = RunControl::default();
        control.try_start().unwrap();
        control.abort(FatalError::Reader("first".into()));
        control.abort(FatalError::Reader("second".into()));
        assert_eq!(control.failure(), Some(FatalError::Reader("first".into())));
        assert_eq!(control.state(), RunState::Stopped);
    }

    #[test]
    fn test_wait_finished_without_launch_returns() {
        let control = RunControl::default();
        control.wait_finished();
        assert!(!control.is_finished());
    }
}
