use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{CasProcessorDeployer, DeploymentKind, ProcessController};
use crate::error::DeploymentError;
use crate::processor::{FencedProxy, StageInstance};
use crate::transport::{Endpoint, SocketTransport};

/// Deploys a stage as separate worker processes reached over sockets.
///
/// Each pooled [`FencedProxy`] is bound to exactly one worker. The deployer
/// owns the endpoints it obtained from the controller and undeploys each of
/// them exactly once.
pub struct FencedDeployer {
    stage: String,
    controller: Arc<dyn ProcessController>,
    transport: SocketTransport,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl FencedDeployer {
    pub fn new(
        stage: impl Into<String>,
        controller: Arc<dyn ProcessController>,
        transport: SocketTransport,
    ) -> Self {
        Self {
            stage: stage.into(),
            controller,
            transport,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    /// Endpoints currently owned by this deployer.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().clone()
    }

    /// Terminates one owned worker.
    pub fn undeploy_endpoint(&self, endpoint: &Endpoint) -> Result<(), DeploymentError> {
        let owned = {
            let mut endpoints = self.endpoints.lock();
            let before = endpoints.len();
            endpoints.retain(|e| e != endpoint);
            endpoints.len() != before
        };
        if owned {
            self.controller.undeploy(endpoint)
        } else {
            Ok(())
        }
    }

    /// Launches `count` workers and records their endpoints.
    fn launch(&self, count: usize) -> Result<Vec<Endpoint>, DeploymentError> {
        let endpoints = self.controller.deploy(&self.stage, count)?;
        if endpoints.len() != count {
            let actual = endpoints.len();
            for endpoint in &endpoints {
                let _ = self.controller.undeploy(endpoint);
            }
            return Err(DeploymentError::EndpointCountMismatch {
                stage: self.stage.clone(),
                expected: count,
                actual,
            });
        }
        self.endpoints.lock().extend(endpoints.iter().cloned());
        Ok(endpoints)
    }

    fn bind_all<'a>(
        &self,
        proxies: impl Iterator<Item = &'a mut FencedProxy>,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), DeploymentError> {
        for (proxy, endpoint) in proxies.zip(endpoints) {
            proxy
                .bind(endpoint)
                .map_err(|source| DeploymentError::Connect {
                    stage: self.stage.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl CasProcessorDeployer for FencedDeployer {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Fenced
    }

    fn deploy(&self, count: usize) -> Result<Vec<StageInstance>, DeploymentError> {
        let endpoints = self.launch(count)?;
        let mut proxies: Vec<FencedProxy> = (0..count)
            .map(|_| FencedProxy::new(self.stage.clone(), self.transport.clone()))
            .collect();

        if let Err(e) = self.bind_all(proxies.iter_mut(), endpoints) {
            drop(proxies);
            let _ = self.undeploy();
            return Err(e);
        }

        info!(stage = %self.stage, count = count, "Deployed fenced workers");
        Ok(proxies.into_iter().map(StageInstance::Fenced).collect())
    }

    /// Terminates every owned worker, launches one per instance and rebinds.
    ///
    /// The caller guarantees no instance is in use.
    fn redeploy(&self, instances: &mut [StageInstance]) -> Result<(), DeploymentError> {
        for instance in instances.iter_mut() {
            if let Some(proxy) = instance.as_fenced_mut() {
                proxy.unbind();
            }
        }
        self.undeploy()?;

        let count = instances.iter().filter(|i| i.is_fenced()).count();
        let endpoints = self.launch(count)?;
        self.bind_all(
            instances.iter_mut().filter_map(StageInstance::as_fenced_mut),
            endpoints,
        )?;

        info!(stage = %self.stage, count = count, "Redeployed fenced workers");
        Ok(())
    }

    fn undeploy(&self) -> Result<(), DeploymentError> {
        let endpoints: Vec<Endpoint> = self.endpoints.lock().drain(..).collect();
        let mut first_error = None;
        for endpoint in &endpoints {
            if let Err(e) = self.controller.undeploy(endpoint) {
                warn!(stage = %self.stage, endpoint = %endpoint, error = %e, "Undeploy failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
