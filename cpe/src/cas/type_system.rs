//! Type system declarations and their merge.
//!
//! Every component publishes [`ProcessingResourceMetaData`] describing the
//! types, indexes and type priorities it relies on. Before CAS pools are
//! allocated the engine merges all of them into one [`MergedTypeSystem`].
//! Merging is additive: compatible redefinitions are unified, incompatible
//! ones fail with a [`ConfigurationError`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ConfigurationError;

/// Root of the type hierarchy.
pub const TOP_TYPE: &str = "uima.cas.TOP";

/// Supertype of every span annotation.
pub const ANNOTATION_TYPE: &str = "uima.tcas.Annotation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescription {
    pub name: String,
    pub range: String,
}

impl FeatureDescription {
    pub fn new(name: impl Into<String>, range: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            range: range.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescription {
    pub name: String,
    pub supertype: String,
    #[serde(default)]
    pub features: Vec<FeatureDescription>,
}

impl TypeDescription {
    pub fn new(name: impl Into<String>, supertype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertype: supertype.into(),
            features: Vec::new(),
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, range: impl Into<String>) -> Self {
        self.features.push(FeatureDescription::new(name, range));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSystemDescription {
    #[serde(default)]
    pub types: Vec<TypeDescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Sorted,
    Set,
    Bag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescription {
    pub label: String,
    pub type_name: String,
    pub kind: IndexKind,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// What a component declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResourceMetaData {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub type_system: TypeSystemDescription,
    #[serde(default)]
    pub indexes: Vec<IndexDescription>,
    /// Each inner list orders types from highest to lowest priority.
    #[serde(default)]
    pub priorities: Vec<Vec<String>>,
}

impl ProcessingResourceMetaData {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, ty: TypeDescription) -> Self {
        self.type_system.types.push(ty);
        self
    }

    pub fn with_index(mut self, index: IndexDescription) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_priorities(mut self, order: Vec<String>) -> Self {
        self.priorities.push(order);
        self
    }
}

/// The union of every component's declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedTypeSystem {
    types: BTreeMap<String, TypeDescription>,
    indexes: BTreeMap<String, IndexDescription>,
    priority_pairs: BTreeSet<(String, String)>,
    contributors: Vec<String>,
}

impl MergedTypeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one component's declarations.
    ///
    /// On error nothing is merged.
    pub fn merge(&mut self, meta: &ProcessingResourceMetaData) -> Result<(), ConfigurationError> {
        let mut staged = self.clone();
        for ty in &meta.type_system.types {
            staged.merge_type(ty)?;
        }
        for index in &meta.indexes {
            staged.merge_index(index)?;
        }
        for order in &meta.priorities {
            staged.merge_priorities(order)?;
        }
        staged.contributors.push(meta.name.clone());
        *self = staged;
        Ok(())
    }

    fn merge_type(&mut self, ty: &TypeDescription) -> Result<(), ConfigurationError> {
        let Some(existing) = self.types.get_mut(&ty.name) else {
            self.types.insert(ty.name.clone(), ty.clone());
            return Ok(());
        };

        if existing.supertype != ty.supertype {
            return Err(ConfigurationError::TypeConflict {
                type_name: ty.name.clone(),
                reason: format!(
                    "supertype '{}' conflicts with '{}'",
                    ty.supertype, existing.supertype
                ),
            });
        }

        for feature in &ty.features {
            match existing.features.iter().find(|f| f.name == feature.name) {
                Some(known) if known.range != feature.range => {
                    return Err(ConfigurationError::TypeConflict {
                        type_name: ty.name.clone(),
                        reason: format!(
                            "feature '{}' has range '{}' and '{}'",
                            feature.name, known.range, feature.range
                        ),
                    });
                }
                Some(_) => {}
                None => existing.features.push(feature.clone()),
            }
        }
        Ok(())
    }

    fn merge_index(&mut self, index: &IndexDescription) -> Result<(), ConfigurationError> {
        match self.indexes.get(&index.label) {
            Some(existing) if existing != index => Err(ConfigurationError::IndexConflict {
                label: index.label.clone(),
                reason: format!(
                    "declared over '{}' ({:?}) and '{}' ({:?})",
                    existing.type_name, existing.kind, index.type_name, index.kind
                ),
            }),
            Some(_) => Ok(()),
            None => {
                self.indexes.insert(index.label.clone(), index.clone());
                Ok(())
            }
        }
    }

    fn merge_priorities(&mut self, order: &[String]) -> Result<(), ConfigurationError> {
        for (i, higher) in order.iter().enumerate() {
            for lower in &order[i + 1..] {
                if self
                    .priority_pairs
                    .contains(&(lower.clone(), higher.clone()))
                {
                    return Err(ConfigurationError::PriorityConflict {
                        first: higher.clone(),
                        second: lower.clone(),
                    });
                }
                self.priority_pairs.insert((higher.clone(), lower.clone()));
            }
        }
        Ok(())
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDescription> {
        self.types.get(name)
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn index(&self, label: &str) -> Option<&IndexDescription> {
        self.indexes.get(label)
    }

    /// Whether `higher` was declared to take priority over `lower`.
    pub fn has_priority(&self, higher: &str, lower: &str) -> bool {
        self.priority_pairs
            .contains(&(higher.to_string(), lower.to_string()))
    }

    /// Names of the components merged so far, in merge order.
    pub fn contributors(&self) -> &[String] {
        &self.contributors
    }
}
