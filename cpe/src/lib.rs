//! CPE - Collection Processing Engine
//!
//! Drives a multi-stage analysis pipeline over a collection of entities.
//! Each entity is read into a pooled [`Cas`](cas::Cas) and pushed through an
//! ordered list of [`ProcessingContainer`](container::ProcessingContainer)s,
//! each owning a pool of stage instances that run in-process or as fenced
//! worker processes reached over a socket.
//!
//! # High-Level API
//!
//! ```ignore
//! use cpe::container::CasProcessorConfig;
//! use cpe::engine::{CpmEngine, TracingStatusListener};
//!
//! let engine = CpmEngine::builder()
//!     .reader(reader)
//!     .integrated_stage(CasProcessorConfig::new("tokens"), tokenizer_factory)
//!     .listener(Arc::new(TracingStatusListener))
//!     .build()?;
//!
//! engine.process()?;
//! engine.wait();
//! println!("{}", engine.get_performance_report());
//! ```

pub mod cas;
pub mod checkpoint;
pub mod components;
pub mod config;
pub mod container;
pub mod deployer;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod transport;

/// Version of the CPE library and CLI.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
