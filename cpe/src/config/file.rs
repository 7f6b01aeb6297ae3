//! CPE descriptor file handling.
//!
//! Settings structs live in [`super::settings`], constants in [`super::defaults`]
//! and parsing in [`super::parser`].

use ini::Ini;
use std::path::Path;
use thiserror::Error;

use super::settings::CpeDescriptor;

/// Descriptor file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read or parse the descriptor
    #[error("Failed to read descriptor: {0}")]
    ReadError(#[from] ini::Error),

    /// Invalid descriptor value
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

impl CpeDescriptor {
    /// Load a descriptor from `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_file(path)?;
        super::parser::parse_ini(&ini)
    }

    /// Parse a descriptor from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigFileError::ReadError(ini::Error::Parse(e)))?;
        super::parser::parse_ini(&ini)
    }
}
