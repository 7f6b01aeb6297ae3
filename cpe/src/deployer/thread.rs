use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::ProcessController;
use crate::error::DeploymentError;
use crate::processor::ProcessorFactory;
use crate::transport::{CasCodec, Endpoint, WorkerServer};

/// Hosts fenced workers on background threads of the current process.
///
/// Every worker is a [`WorkerServer`] on its own loopback port, so calls still
/// cross a real socket. Undeploying a worker shuts its server down and severs
/// its connections, which is what the client sees when a worker process dies.
pub struct ThreadProcessController {
    factory: ProcessorFactory,
    codec: Arc<dyn CasCodec>,
    workers: Mutex<HashMap<Endpoint, WorkerServer>>,
    deployed: AtomicUsize,
    undeployed: AtomicUsize,
}

impl ThreadProcessController {
    pub fn new(factory: ProcessorFactory, codec: Arc<dyn CasCodec>) -> Self {
        Self {
            factory,
            codec,
            workers: Mutex::new(HashMap::new()),
            deployed: AtomicUsize::new(0),
            undeployed: AtomicUsize::new(0),
        }
    }

    /// Workers deployed and not yet undeployed.
    pub fn live_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Total workers ever deployed.
    pub fn deployed_count(&self) -> usize {
        self.deployed.load(Ordering::SeqCst)
    }

    /// Total workers undeployed.
    pub fn undeployed_count(&self) -> usize {
        self.undeployed.load(Ordering::SeqCst)
    }

    /// Stops a worker without undeploying it, as if its process crashed.
    ///
    /// Returns `false` if the endpoint is unknown.
    pub fn crash(&self, endpoint: &Endpoint) -> bool {
        match self.workers.lock().get_mut(endpoint) {
            Some(server) => {
                server.shutdown();
                true
            }
            None => false,
        }
    }

    /// Endpoints of all live workers.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.workers.lock().keys().cloned().collect()
    }
}

impl ProcessController for ThreadProcessController {
    fn deploy(&self, stage: &str, count: usize) -> Result<Vec<Endpoint>, DeploymentError> {
        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            let server = WorkerServer::bind(
                "127.0.0.1:0",
                Arc::clone(&self.factory),
                Arc::clone(&self.codec),
            )
            .map_err(|e| DeploymentError::Launch {
                stage: stage.to_string(),
                reason: e.to_string(),
            })?;
            started.push(server);
        }

        let mut workers = self.workers.lock();
        let endpoints = started
            .into_iter()
            .map(|server| {
                let endpoint = server.endpoint();
                workers.insert(endpoint.clone(), server);
                endpoint
            })
            .collect();
        self.deployed.fetch_add(count, Ordering::SeqCst);
        debug!(stage = stage, count = count, "Started in-process workers");
        Ok(endpoints)
    }

    fn undeploy(&self, endpoint: &Endpoint) -> Result<(), DeploymentError> {
        let mut server = self
            .workers
            .lock()
            .remove(endpoint)
            .ok_or_else(|| DeploymentError::UnknownEndpoint(endpoint.clone()))?;
        server.shutdown();
        self.undeployed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
