//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and appropriate exit codes.

use std::fmt;
use std::process;

use cpe::config::ConfigFileError;
use cpe::error::{ConfigurationError, EngineError, FatalError};

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Descriptor could not be loaded
    Descriptor { path: String, error: ConfigFileError },
    /// Descriptor named unknown components or invalid settings
    Config(ConfigurationError),
    /// Engine refused to start or restore
    Engine(EngineError),
    /// The run started but was aborted
    Aborted(FatalError),
    /// Worker could not bind its listener
    WorkerBind { addr: String, error: std::io::Error },
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Config(ConfigurationError::UnknownComponent(_)) => {
                eprintln!();
                eprintln!("Built-in components:");
                eprintln!("  readers:    directory");
                eprintln!("  processors: whitespace_tokenizer, token_statistics");
            }
            CliError::Engine(EngineError::Deployment(_)) => {
                eprintln!();
                eprintln!("Common issues:");
                eprintln!("  1. Worker command not executable or not on PATH");
                eprintln!("  2. Worker did not print 'LISTENING <host:port>' before the startup timeout");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Descriptor { path, error } => {
                write!(f, "Failed to load descriptor '{}': {}", path, error)
            }
            CliError::Config(e) => write!(f, "Configuration error: {}", e),
            CliError::Engine(e) => write!(f, "Engine error: {}", e),
            CliError::Aborted(e) => write!(f, "Run aborted: {}", e),
            CliError::WorkerBind { addr, error } => {
                write!(f, "Failed to listen on '{}': {}", addr, error)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Descriptor { error, .. } => Some(error),
            CliError::Config(e) => Some(e),
            CliError::Engine(e) => Some(e),
            CliError::Aborted(e) => Some(e),
            CliError::WorkerBind { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<ConfigurationError> for CliError {
    fn from(e: ConfigurationError) -> Self {
        CliError::Config(e)
    }
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        CliError::Engine(e)
    }
}
