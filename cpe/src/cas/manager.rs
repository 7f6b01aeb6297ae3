//! CAS pool manager.
//!
//! Collects type system metadata from every component, then pre-allocates
//! one pool of CAS instances per consumer. Once the first pool is defined the
//! type system is sealed: further metadata is rejected.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::type_system::{MergedTypeSystem, ProcessingResourceMetaData};
use super::{Cas, CasInterface, ViewKind};
use crate::error::ConfigurationError;
use crate::pool::{PoolError, PoolStats, ServiceProxyPool};

/// Default initial document buffer size per CAS, in bytes.
pub const DEFAULT_INITIAL_HEAP_SIZE: usize = 64 * 1024;

/// Allocation hints for a CAS pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasTuning {
    /// Bytes reserved up front for each CAS's document buffer.
    pub initial_heap_size: usize,
}

impl Default for CasTuning {
    fn default() -> Self {
        Self {
            initial_heap_size: DEFAULT_INITIAL_HEAP_SIZE,
        }
    }
}

/// Reasons a CAS could not be acquired.
#[derive(Debug, Error)]
pub enum CasAcquireError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("CAS pool for '{0}' is closed")]
    Closed(String),

    #[error("Timed out waiting for a CAS from '{0}'")]
    Timeout(String),
}

/// Owns the merged type system and all CAS pools.
#[derive(Debug, Default)]
pub struct CasManager {
    type_system: RwLock<MergedTypeSystem>,
    pools: RwLock<HashMap<String, Arc<ServiceProxyPool<Cas>>>>,
    next_id: AtomicU64,
}

impl CasManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a component's type system declarations.
    ///
    /// Fails with [`ConfigurationError::MetadataSealed`] once any pool exists,
    /// and with a conflict error when declarations are incompatible.
    pub fn add_meta_data(&self, meta: &ProcessingResourceMetaData) -> Result<(), ConfigurationError> {
        if !self.pools.read().is_empty() {
            return Err(ConfigurationError::MetadataSealed);
        }
        self.type_system.write().merge(meta)?;
        debug!(component = %meta.name, "Merged component metadata");
        Ok(())
    }

    /// Pre-allocates `size` CAS instances for `consumer_id`.
    pub fn define_cas_pool(
        &self,
        consumer_id: &str,
        size: usize,
        tuning: CasTuning,
    ) -> Result<(), ConfigurationError> {
        if size == 0 {
            return Err(ConfigurationError::InvalidPoolSize {
                consumer: consumer_id.to_string(),
                size,
            });
        }

        let mut pools = self.pools.write();
        if pools.contains_key(consumer_id) {
            return Err(ConfigurationError::DuplicateConsumer(consumer_id.to_string()));
        }

        let instances = (0..size).map(|_| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            Cas::with_capacity(id, &tuning)
        });
        pools.insert(
            consumer_id.to_string(),
            Arc::new(ServiceProxyPool::with_instances(consumer_id, instances)),
        );

        info!(
            consumer = consumer_id,
            size = size,
            initial_heap_size = tuning.initial_heap_size,
            "Defined CAS pool"
        );
        Ok(())
    }

    /// Acquires a CAS for `consumer_id`, blocking while the pool is exhausted.
    pub fn get_cas(&self, consumer_id: &str) -> Result<CasLease, CasAcquireError> {
        let pool = self.pool(consumer_id)?;
        let cas = pool
            .check_out()
            .map_err(|_| CasAcquireError::Closed(consumer_id.to_string()))?;
        Ok(CasLease::new(cas, pool))
    }

    /// Like [`get_cas`](Self::get_cas), giving up after `timeout`.
    pub fn get_cas_timeout(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> Result<CasLease, CasAcquireError> {
        let pool = self.pool(consumer_id)?;
        let cas = pool.check_out_timeout(timeout).map_err(|e| match e {
            PoolError::Closed => CasAcquireError::Closed(consumer_id.to_string()),
            PoolError::Timeout => CasAcquireError::Timeout(consumer_id.to_string()),
        })?;
        Ok(CasLease::new(cas, pool))
    }

    /// Returns a typed view over `cas`. The view aliases `cas`.
    pub fn get_cas_interface<'a>(&self, cas: &'a mut Cas, kind: ViewKind) -> CasInterface<'a> {
        cas.view(kind)
    }

    /// A copy of the merged type system.
    pub fn type_system(&self) -> MergedTypeSystem {
        self.type_system.read().clone()
    }

    pub fn pool_stats(&self, consumer_id: &str) -> Option<PoolStats> {
        self.pools.read().get(consumer_id).map(|p| p.stats())
    }

    /// Closes every pool, waking blocked acquirers.
    pub fn close(&self) {
        for pool in self.pools.read().values() {
            pool.close();
        }
    }

    fn pool(&self, consumer_id: &str) -> Result<Arc<ServiceProxyPool<Cas>>, ConfigurationError> {
        self.pools
            .read()
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownConsumer(consumer_id.to_string()))
    }
}

/// Exclusive use of one pooled CAS.
///
/// Dropping the lease resets the CAS and returns it to its pool.
pub struct CasLease {
    cas: Option<Cas>,
    pool: Arc<ServiceProxyPool<Cas>>,
}

impl CasLease {
    fn new(cas: Cas, pool: Arc<ServiceProxyPool<Cas>>) -> Self {
        Self {
            cas: Some(cas),
            pool,
        }
    }
}

impl Deref for CasLease {
    type Target = Cas;

    fn deref(&self) -> &Cas {
        // Only `Drop` takes the CAS out.
        self.cas.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for CasLease {
    fn deref_mut(&mut self) -> &mut Cas {
        self.cas.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for CasLease {
    fn drop(&mut self) {
        if let Some(mut cas) = self.cas.take() {
            cas.reset();
            self.pool.check_in(cas);
        }
    }
}

impl std::fmt::Debug for CasLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasLease")
            .field("cas_id", &self.cas.as_ref().map(Cas::id))
            .field("pool", &self.pool.name())
            .finish()
    }
}
