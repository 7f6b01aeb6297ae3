use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cas::Cas;
use crate::engine::{CollectionReader, Progress, SynchPoint, UNIT_BYTES, UNIT_ENTITIES};
use crate::error::{ConfigurationError, ReaderError};

use super::ComponentParams;

/// Registry name of [`DirectoryReader`].
pub const DIRECTORY_READER: &str = "directory";

/// Reads one entity per file of a directory, in file name order.
///
/// Parameters: `directory` (required), `extension` (only files with this
/// extension), `language` (set on every CAS).
#[derive(Debug)]
pub struct DirectoryReader {
    files: Vec<(PathBuf, u64)>,
    next: usize,
    bytes_read: u64,
    total_bytes: u64,
    language: Option<String>,
}

impl DirectoryReader {
    pub fn open(directory: &Path, extension: Option<&str>) -> Result<Self, ReaderError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            if let Some(wanted) = extension {
                let wanted = wanted.trim_start_matches('.');
                if path.extension().and_then(|e| e.to_str()) != Some(wanted) {
                    continue;
                }
            }
            files.push((path, metadata.len()));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let total_bytes = files.iter().map(|(_, len)| len).sum();
        debug!(
            directory = %directory.display(),
            files = files.len(),
            bytes = total_bytes,
            "Opened directory collection"
        );
        Ok(Self {
            files,
            next: 0,
            bytes_read: 0,
            total_bytes,
            language: None,
        })
    }

    pub fn from_params(params: &ComponentParams) -> Result<Self, ConfigurationError> {
        let directory = PathBuf::from(params.require("directory")?);
        let reader = Self::open(&directory, params.get("extension")).map_err(|e| {
            ConfigurationError::invalid(
                params.component(),
                format!("cannot read {}: {}", directory.display(), e),
            )
        })?;
        Ok(match params.get("language") {
            Some(language) => reader.with_language(language),
            None => reader,
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl CollectionReader for DirectoryReader {
    fn has_next(&mut self) -> Result<bool, ReaderError> {
        Ok(self.next < self.files.len())
    }

    fn get_next(&mut self, cas: &mut Cas) -> Result<(), ReaderError> {
        let (path, len) = self
            .files
            .get(self.next)
            .ok_or_else(|| ReaderError::Failed("collection exhausted".to_string()))?;
        let bytes = fs::read(path)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        cas.set_document_id(name);
        cas.set_document_text(String::from_utf8_lossy(&bytes).into_owned());
        if let Some(language) = &self.language {
            cas.set_language(language.clone());
        }

        self.bytes_read += len;
        self.next += 1;
        Ok(())
    }

    fn progress(&self) -> Vec<Progress> {
        vec![
            Progress::new(self.next as u64, Some(self.files.len() as u64), UNIT_ENTITIES),
            Progress::new(self.bytes_read, Some(self.total_bytes), UNIT_BYTES),
        ]
    }

    fn synch_point(&self) -> Option<SynchPoint> {
        Some(SynchPoint(serde_json::json!({ "next_index": self.next })))
    }

    fn restore(&mut self, point: &SynchPoint) -> Result<(), ReaderError> {
        let index = point
            .0
            .get("next_index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ReaderError::InvalidSynchPoint(point.0.to_string()))?
            as usize;
        if index > self.files.len() {
            return Err(ReaderError::InvalidSynchPoint(format!(
                "next_index {} beyond {} files",
                index,
                self.files.len()
            )));
        }
        self.next = index;
        self.bytes_read = self.files[..index].iter().map(|(_, len)| len).sum();
        Ok(())
    }
}
