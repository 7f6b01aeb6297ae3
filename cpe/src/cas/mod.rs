//! The CAS: the mutable per-entity work container.
//!
//! A [`Cas`] carries one document, the annotations stages add to it, and free
//! form metadata. It is owned by exactly one pipeline thread for the duration
//! of a traversal and recycled through the [`CasManager`] afterwards.
//!
//! Typed views ([`CasInterface`]) borrow the same CAS mutably; they alias the
//! underlying instance and never copy it.

mod manager;
pub mod type_system;

pub use manager::{CasAcquireError, CasLease, CasManager, CasTuning, DEFAULT_INITIAL_HEAP_SIZE};
pub use type_system::{
    FeatureDescription, IndexDescription, IndexKind, MergedTypeSystem, ProcessingResourceMetaData,
    TypeDescription, TypeSystemDescription, ANNOTATION_TYPE, TOP_TYPE,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed span over the document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub type_name: String,
    pub begin: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, serde_json::Value>,
}

impl Annotation {
    pub fn new(type_name: impl Into<String>, begin: usize, end: usize) -> Self {
        Self {
            type_name: type_name.into(),
            begin,
            end,
            features: BTreeMap::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    /// The text this annotation covers, if its offsets are valid.
    pub fn covered_text<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.get(self.begin..self.end)
    }
}

/// Mutable work container for one entity.
///
/// The pool slot `id` identifies the instance for its whole lifetime and is
/// not part of the serialized payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cas {
    #[serde(skip)]
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
    #[serde(default)]
    document_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(default)]
    annotations: Vec<Annotation>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

/// A saved copy of a CAS's contents, used to re-run a failed entity.
#[derive(Debug, Clone)]
pub struct CasSnapshot(Cas);

impl Cas {
    /// Creates an empty, unpooled CAS.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_capacity(id: u64, tuning: &CasTuning) -> Self {
        Self {
            id,
            document_text: String::with_capacity(tuning.initial_heap_size),
            ..Self::default()
        }
    }

    /// Pool slot identity; stable across resets.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn set_document_id(&mut self, id: impl Into<String>) {
        self.document_id = Some(id.into());
    }

    pub fn document_text(&self) -> &str {
        &self.document_text
    }

    pub fn set_document_text(&mut self, text: impl Into<String>) {
        self.document_text = text.into();
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = Some(language.into());
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Adds an annotation and returns its index.
    pub fn add_annotation(&mut self, annotation: Annotation) -> usize {
        self.annotations.push(annotation);
        self.annotations.len() - 1
    }

    /// Annotations of one type, in insertion order.
    pub fn select<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a Annotation> + 'a {
        self.annotations
            .iter()
            .filter(move |a| a.type_name == type_name)
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Approximate payload size in bytes, used for progress accounting.
    pub fn size_bytes(&self) -> usize {
        self.document_text.len()
    }

    /// Clears all content but keeps the slot identity and allocated capacity.
    pub fn reset(&mut self) {
        self.document_id = None;
        self.document_text.clear();
        self.language = None;
        self.annotations.clear();
        self.metadata.clear();
    }

    pub fn snapshot(&self) -> CasSnapshot {
        CasSnapshot(self.clone())
    }

    /// Restores contents saved by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, snapshot: &CasSnapshot) {
        let id = self.id;
        self.clone_from(&snapshot.0);
        self.id = id;
    }

    /// Replaces the payload with one received from elsewhere, keeping identity.
    pub(crate) fn replace_payload(&mut self, other: Cas) {
        let id = self.id;
        *self = other;
        self.id = id;
    }

    /// Borrows this CAS through a typed view.
    pub fn view(&mut self, kind: ViewKind) -> CasInterface<'_> {
        match kind {
            ViewKind::Text => CasInterface::Text(TextView { cas: self }),
            ViewKind::Annotations => CasInterface::Annotations(AnnotationView { cas: self }),
            ViewKind::Metadata => CasInterface::Metadata(MetadataView { cas: self }),
        }
    }
}

// =============================================================================
// Views
// =============================================================================

/// The kinds of typed view a CAS offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Text,
    Annotations,
    Metadata,
}

/// A typed view over one CAS. All variants alias the same instance.
#[derive(Debug)]
pub enum CasInterface<'a> {
    Text(TextView<'a>),
    Annotations(AnnotationView<'a>),
    Metadata(MetadataView<'a>),
}

impl<'a> CasInterface<'a> {
    pub fn kind(&self) -> ViewKind {
        match self {
            Self::Text(_) => ViewKind::Text,
            Self::Annotations(_) => ViewKind::Annotations,
            Self::Metadata(_) => ViewKind::Metadata,
        }
    }

    /// Identity of the underlying CAS.
    pub fn cas_id(&self) -> u64 {
        match self {
            Self::Text(v) => v.cas.id,
            Self::Annotations(v) => v.cas.id,
            Self::Metadata(v) => v.cas.id,
        }
    }

    pub fn into_text(self) -> Option<TextView<'a>> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_annotations(self) -> Option<AnnotationView<'a>> {
        match self {
            Self::Annotations(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_metadata(self) -> Option<MetadataView<'a>> {
        match self {
            Self::Metadata(v) => Some(v),
            _ => None,
        }
    }
}

/// Document text and language.
#[derive(Debug)]
pub struct TextView<'a> {
    cas: &'a mut Cas,
}

impl TextView<'_> {
    pub fn text(&self) -> &str {
        &self.cas.document_text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.cas.document_text = text.into();
    }

    pub fn language(&self) -> Option<&str> {
        self.cas.language.as_deref()
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.cas.language = Some(language.into());
    }
}

/// The annotation index.
#[derive(Debug)]
pub struct AnnotationView<'a> {
    cas: &'a mut Cas,
}

impl AnnotationView<'_> {
    pub fn add(&mut self, annotation: Annotation) -> usize {
        self.cas.add_annotation(annotation)
    }

    pub fn len(&self) -> usize {
        self.cas.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cas.annotations.is_empty()
    }

    pub fn count_of(&self, type_name: &str) -> usize {
        self.cas.select(type_name).count()
    }

    /// Removes every annotation of `type_name`, returning how many were removed.
    pub fn remove_type(&mut self, type_name: &str) -> usize {
        let before = self.cas.annotations.len();
        self.cas.annotations.retain(|a| a.type_name != type_name);
        before - self.cas.annotations.len()
    }

    pub fn covered_text(&self, index: usize) -> Option<&str> {
        let annotation = self.cas.annotations.get(index)?;
        annotation.covered_text(&self.cas.document_text)
    }
}

/// Free-form key/value metadata.
#[derive(Debug)]
pub struct MetadataView<'a> {
    cas: &'a mut Cas,
}

impl MetadataView<'_> {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.cas.metadata.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.cas.metadata.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.cas.metadata.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cas.metadata.keys().map(String::as_str)
    }
}
