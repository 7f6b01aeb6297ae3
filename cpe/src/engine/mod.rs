//! Collection processing engine.
//!
//! [`CpmEngine`] owns the collection reader, the processing containers and
//! the pipeline threads, and exposes run control:
//!
//! ```text
//! Idle --process--> Running --pause--> Paused --resume--> Running
//! Running/Paused --stop--> Stopped
//! Running --collection exhausted--> Completed
//! ```
//!
//! Progress is reported through [`StatusListener`] callbacks and on demand
//! through [`CpmEngine::get_performance_report`] and
//! [`CpmEngine::get_progress`].

mod control;
mod cpm;
mod listener;
mod pipeline;
mod reader;
mod report;
mod state;

pub use cpm::{CpmConfig, CpmEngine, CpmEngineBuilder, DEFAULT_ENGINE_NAME};
pub use listener::{
    EntityStatus, ListenerSet, NullStatusListener, StatusListener, TracingStatusListener,
};
pub use reader::{CollectionReader, Progress, SynchPoint, UNIT_BYTES, UNIT_ENTITIES};
pub use report::{ContainerReport, PerformanceReport};
pub use state::RunState;
