//! Launching and terminating stage instances.
//!
//! A [`CasProcessorDeployer`] produces the instances that fill a container's
//! pool and knows how to restart them:
//!
//! - [`IntegratedDeployer`]: in-process instances from a [`ProcessorFactory`]
//! - [`FencedDeployer`]: [`FencedProxy`] instances bound 1:1 to workers started
//!   by a [`ProcessController`]
//!
//! Two process controllers are provided. [`LocalProcessController`] spawns
//! worker processes; [`ThreadProcessController`] hosts workers on background
//! threads of the current process behind real sockets.
//!
//! [`ProcessorFactory`]: crate::processor::ProcessorFactory
//! [`FencedProxy`]: crate::processor::FencedProxy

mod fenced;
mod integrated;
mod local;
mod thread;

pub use fenced::FencedDeployer;
pub use integrated::IntegratedDeployer;
pub use local::{LocalProcessController, DEFAULT_STARTUP_TIMEOUT, LISTENING_PREFIX};
pub use thread::ThreadProcessController;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DeploymentError;
use crate::processor::StageInstance;
use crate::transport::Endpoint;

/// Where a stage's instances run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentKind {
    #[default]
    Integrated,
    Fenced,
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integrated => "integrated",
            Self::Fenced => "fenced",
        }
    }
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "integrated" | "local" => Ok(Self::Integrated),
            "fenced" | "remote" => Ok(Self::Fenced),
            other => Err(format!("unknown deployment kind '{}'", other)),
        }
    }
}

/// Launches and terminates worker processes for fenced stages.
pub trait ProcessController: Send + Sync {
    /// Starts `count` workers for `stage` and returns their addresses.
    fn deploy(&self, stage: &str, count: usize) -> Result<Vec<Endpoint>, DeploymentError>;

    /// Terminates one worker. Called exactly once per endpoint.
    fn undeploy(&self, endpoint: &Endpoint) -> Result<(), DeploymentError>;
}

/// Creates, restarts and tears down the instances of one stage.
pub trait CasProcessorDeployer: Send + Sync {
    fn kind(&self) -> DeploymentKind;

    /// Creates `count` ready-to-use instances.
    fn deploy(&self, count: usize) -> Result<Vec<StageInstance>, DeploymentError>;

    /// Restarts whatever backs `instances`, which the caller owns exclusively.
    fn redeploy(&self, instances: &mut [StageInstance]) -> Result<(), DeploymentError>;

    /// Releases every external resource this deployer owns.
    fn undeploy(&self) -> Result<(), DeploymentError>;
}
