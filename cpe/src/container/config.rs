//! Per-stage configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::deployer::DeploymentKind;
use crate::transport::DEFAULT_CALL_TIMEOUT;

/// Default instances per stage.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default consecutive failures before the error action applies (0 = never).
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: usize = 0;

/// Default restart budget for fenced stages.
pub const DEFAULT_MAX_RESTARTS: usize = 3;

/// What happens when a stage reaches its consecutive error limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAction {
    /// Bypass the stage until it is redeployed.
    #[default]
    Disable,
    /// Abort the whole run.
    Terminate,
    /// Reset the counter and keep going.
    Continue,
}

/// What happens when a fenced stage exhausts its restart budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartAction {
    Disable,
    #[default]
    Terminate,
}

impl ErrorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Terminate => "terminate",
            Self::Continue => "continue",
        }
    }
}

impl RestartAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RestartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "terminate" => Ok(Self::Terminate),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown error action '{}'", other)),
        }
    }
}

impl FromStr for RestartAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown restart action '{}'", other)),
        }
    }
}

/// Configuration for one processing container.
#[derive(Debug, Clone, PartialEq)]
pub struct CasProcessorConfig {
    /// Stage name, unique within an engine.
    pub name: String,
    pub deployment: DeploymentKind,
    /// Number of pooled instances.
    pub pool_size: usize,
    /// Consecutive failures that trigger `action_on_max_errors`. 0 disables the check.
    pub max_consecutive_errors: usize,
    pub action_on_max_errors: ErrorAction,
    /// Redeploys allowed after fenced connection failures.
    pub max_restarts: usize,
    pub action_on_max_restarts: RestartAction,
    /// Deadline for one fenced call.
    pub call_timeout: Duration,
    /// Bound on waiting for a free instance. `None` waits indefinitely.
    pub checkout_timeout: Option<Duration>,
    /// Entities per `batch_process_complete` on the stage. 0 disables.
    pub batch_size: usize,
}

impl CasProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deployment: DeploymentKind::Integrated,
            pool_size: DEFAULT_POOL_SIZE,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            action_on_max_errors: ErrorAction::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            action_on_max_restarts: RestartAction::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            checkout_timeout: None,
            batch_size: 0,
        }
    }

    pub fn with_deployment(mut self, deployment: DeploymentKind) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: usize) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn with_action_on_max_errors(mut self, action: ErrorAction) -> Self {
        self.action_on_max_errors = action;
        self
    }

    pub fn with_max_restarts(mut self, max: usize) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn with_action_on_max_restarts(mut self, action: RestartAction) -> Self {
        self.action_on_max_restarts = action;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = Some(timeout);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CasProcessorConfig::new("stage");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.action_on_max_errors, ErrorAction::Disable);
        assert_eq!(config.action_on_max_restarts, RestartAction::Terminate);
        assert!(config.checkout_timeout.is_none());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Terminate".parse::<ErrorAction>(), Ok(ErrorAction::Terminate));
        assert_eq!(" continue ".parse::<ErrorAction>(), Ok(ErrorAction::Continue));
        assert!("retry".parse::<ErrorAction>().is_err());
        assert!("continue".parse::<RestartAction>().is_err());
    }
}
