use serde::{Deserialize, Serialize};
use std::fmt;

/// Global state of a CPM run.
///
/// ```text
/// Idle --process--> Running --pause--> Paused --resume--> Running
/// Running/Paused --stop--> Stopped
/// Running --collection exhausted--> Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl RunState {
    /// Stopped and Completed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }

    /// Running or Paused.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
