//! Named components.
//!
//! Descriptors and the `worker` command refer to readers and processors by
//! name. A [`ComponentRegistry`] maps those names to constructors taking
//! free-form [`ComponentParams`].

mod directory;
mod statistics;
mod tokenizer;

pub use directory::{DirectoryReader, DIRECTORY_READER};
pub use statistics::{TokenStatistics, DISTINCT_TOKENS_KEY, TOKEN_COUNT_KEY, TOKEN_STATISTICS};
pub use tokenizer::{WhitespaceTokenizer, TOKEN_TYPE, WHITESPACE_TOKENIZER};

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use crate::engine::CollectionReader;
use crate::error::{ConfigurationError, ProcessingError};
use crate::processor::{CasProcessor, ProcessorFactory};

/// String parameters handed to a component constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentParams {
    component: String,
    values: BTreeMap<String, String>,
}

impl ComponentParams {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Component these parameters belong to, used in error messages.
    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigurationError> {
        self.get(key).ok_or_else(|| {
            ConfigurationError::invalid(&self.component, format!("missing parameter '{}'", key))
        })
    }

    /// Parses `key` if present.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|e| {
                    ConfigurationError::invalid(
                        &self.component,
                        format!("parameter '{}' = '{}': {}", key, raw, e),
                    )
                })
            })
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub type ReaderConstructor =
    Arc<dyn Fn(&ComponentParams) -> Result<Box<dyn CollectionReader>, ConfigurationError> + Send + Sync>;

pub type ProcessorConstructor =
    Arc<dyn Fn(&ComponentParams) -> Result<Box<dyn CasProcessor>, ConfigurationError> + Send + Sync>;

/// Readers and processors by name.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    readers: HashMap<String, ReaderConstructor>,
    processors: HashMap<String, ProcessorConstructor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in components.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_reader(DIRECTORY_READER, |params| {
            Ok(Box::new(DirectoryReader::from_params(params)?))
        });
        registry.register_processor(WHITESPACE_TOKENIZER, |params| {
            Ok(Box::new(WhitespaceTokenizer::from_params(params)?))
        });
        registry.register_processor(TOKEN_STATISTICS, |_| Ok(Box::new(TokenStatistics::new())));
        registry
    }

    pub fn register_reader<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&ComponentParams) -> Result<Box<dyn CollectionReader>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.readers.insert(name.into(), Arc::new(constructor));
    }

    pub fn register_processor<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&ComponentParams) -> Result<Box<dyn CasProcessor>, ConfigurationError>
            + Send
            + Sync
            + 'static,
    {
        self.processors.insert(name.into(), Arc::new(constructor));
    }

    pub fn has_processor(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn reader(
        &self,
        name: &str,
        params: &ComponentParams,
    ) -> Result<Box<dyn CollectionReader>, ConfigurationError> {
        let constructor = self
            .readers
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownComponent(name.to_string()))?;
        constructor(params)
    }

    /// A factory producing fresh `name` instances.
    ///
    /// Builds one instance up front so bad parameters surface here rather
    /// than at deployment.
    pub fn processor_factory(
        &self,
        name: &str,
        params: &ComponentParams,
    ) -> Result<ProcessorFactory, ConfigurationError> {
        let constructor = Arc::clone(
            self.processors
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownComponent(name.to_string()))?,
        );
        constructor(params)?;

        let params = params.clone();
        Ok(Arc::new(move || {
            constructor(&params).map_err(|e| ProcessingError::new(params.component(), e.to_string()))
        }))
    }

    pub fn processor_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.processors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("processors", &self.processor_names())
            .finish()
    }
}
