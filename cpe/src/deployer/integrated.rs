use tracing::debug;

use super::{CasProcessorDeployer, DeploymentKind};
use crate::error::DeploymentError;
use crate::processor::{ProcessorFactory, StageInstance};

/// Deploys stage instances into the engine's own process.
pub struct IntegratedDeployer {
    stage: String,
    factory: ProcessorFactory,
}

impl IntegratedDeployer {
    pub fn new(stage: impl Into<String>, factory: ProcessorFactory) -> Self {
        Self {
            stage: stage.into(),
            factory,
        }
    }

    fn instantiate(&self) -> Result<StageInstance, DeploymentError> {
        (self.factory)()
            .map(StageInstance::Integrated)
            .map_err(|e| DeploymentError::Launch {
                stage: self.stage.clone(),
                reason: e.to_string(),
            })
    }
}

impl CasProcessorDeployer for IntegratedDeployer {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Integrated
    }

    fn deploy(&self, count: usize) -> Result<Vec<StageInstance>, DeploymentError> {
        debug!(stage = %self.stage, count = count, "Creating integrated instances");
        (0..count).map(|_| self.instantiate()).collect()
    }

    /// Replaces every instance with a fresh one from the factory.
    fn redeploy(&self, instances: &mut [StageInstance]) -> Result<(), DeploymentError> {
        for slot in instances.iter_mut() {
            *slot = self.instantiate()?;
        }
        Ok(())
    }

    fn undeploy(&self) -> Result<(), DeploymentError> {
        Ok(())
    }
}
