//! CPE descriptors.
//!
//! A descriptor is an INI file naming the collection reader and the ordered
//! pipeline stages:
//!
//! ```ini
//! [cpe]
//! name = corpus
//! pipelines = 2
//! parallel = true
//!
//! [reader]
//! component = directory
//! directory = ./docs
//!
//! [processor.tokens]
//! component = whitespace_tokenizer
//!
//! [processor.stats]
//! component = token_statistics
//! deployment = fenced
//! pool_size = 2
//! ```
//!
//! Loading produces a [`CpeDescriptor`]; [`CpeDescriptor::build_engine`]
//! resolves component names through a
//! [`ComponentRegistry`](crate::components::ComponentRegistry).

mod assembly;
mod defaults;
mod file;
mod parser;
mod settings;

pub use assembly::WORKER_SUBCOMMAND;
pub use defaults::{DEFAULT_PIPELINES, DEFAULT_TIMEOUT_MS};
pub use file::ConfigFileError;
pub use parser::PROCESSOR_SECTION_PREFIX;
pub use settings::{CheckpointSettings, CpeDescriptor, CpeSettings, ProcessorSettings, ReaderSettings};
