//! Collection reader SPI.

use serde::{Deserialize, Serialize};

use crate::cas::{Cas, ProcessingResourceMetaData};
use crate::error::ReaderError;

/// Progress unit counting entities.
pub const UNIT_ENTITIES: &str = "entities";

/// Progress unit counting bytes of input.
pub const UNIT_BYTES: &str = "bytes";

/// One independent progress measure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    /// `None` when the collection size is unknown.
    pub total: Option<u64>,
    pub unit: String,
}

impl Progress {
    pub fn new(completed: u64, total: Option<u64>, unit: impl Into<String>) -> Self {
        Self {
            completed,
            total,
            unit: unit.into(),
        }
    }

    /// Fraction complete in `[0, 1]`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Opaque recovery marker produced and consumed by a reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SynchPoint(pub serde_json::Value);

/// Source of entities.
///
/// The engine serializes every call, so implementations need no internal
/// locking even with several pipelines.
pub trait CollectionReader: Send {
    fn has_next(&mut self) -> Result<bool, ReaderError>;

    /// Fills `cas` with the next entity. The CAS arrives reset.
    fn get_next(&mut self, cas: &mut Cas) -> Result<(), ReaderError>;

    fn progress(&self) -> Vec<Progress>;

    /// Marker describing the current read position, if supported.
    fn synch_point(&self) -> Option<SynchPoint> {
        None
    }

    /// Repositions the reader to a marker from [`synch_point`](Self::synch_point).
    fn restore(&mut self, _point: &SynchPoint) -> Result<(), ReaderError> {
        Err(ReaderError::RestoreUnsupported)
    }

    /// Types the reader writes into the CAS.
    fn metadata(&self) -> Option<ProcessingResourceMetaData> {
        None
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress::new(5, Some(10), UNIT_ENTITIES).fraction(), Some(0.5));
        assert_eq!(Progress::new(0, Some(0), UNIT_BYTES).fraction(), Some(1.0));
        assert_eq!(Progress::new(3, None, UNIT_ENTITIES).fraction(), None);
    }

    #[test]
    fn test_synch_point_serializes_transparently() {
        let point = SynchPoint(serde_json::json!({ "next_index": 4 }));
        let text = serde_json::to_string(&point).unwrap();
        assert_eq!(text, r#"{"next_index":4}"#);
    }
}
