//! Conversion of descriptors into engine types.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::settings::*;
use crate::cas::CasTuning;
use crate::checkpoint::CheckpointConfig;
use crate::components::{ComponentParams, ComponentRegistry};
use crate::container::CasProcessorConfig;
use crate::deployer::{DeploymentKind, LocalProcessController};
use crate::engine::{CpmConfig, CpmEngine, CpmEngineBuilder};
use crate::error::ConfigurationError;

/// Subcommand the default worker command line invokes.
pub const WORKER_SUBCOMMAND: &str = "worker";

impl CpeSettings {
    pub fn to_cpm_config(&self, checkpoint: &CheckpointSettings) -> CpmConfig {
        CpmConfig {
            name: self.name.clone(),
            pipelines: self.pipelines,
            parallel: self.parallel,
            cas_pool_size: self.cas_pool_size,
            pause_on_exception: self.pause_on_exception,
            batch_size: self.batch_size,
            entity_limit: self.entity_limit,
            cas_tuning: CasTuning {
                initial_heap_size: self.cas_initial_heap_size,
            },
            checkpoint: checkpoint
                .file
                .as_ref()
                .map(|file| CheckpointConfig::new(file).with_batch(checkpoint.batch)),
        }
    }
}

impl ProcessorSettings {
    pub fn to_container_config(&self) -> CasProcessorConfig {
        let mut config = CasProcessorConfig::new(self.name.clone())
            .with_deployment(self.deployment)
            .with_pool_size(self.pool_size)
            .with_max_consecutive_errors(self.max_consecutive_errors)
            .with_action_on_max_errors(self.action_on_max_errors)
            .with_max_restarts(self.max_restarts)
            .with_action_on_max_restarts(self.action_on_max_restarts)
            .with_call_timeout(Duration::from_millis(self.timeout_ms))
            .with_batch_size(self.batch_size);
        if self.checkout_timeout_ms > 0 {
            config = config.with_checkout_timeout(Duration::from_millis(self.checkout_timeout_ms));
        }
        config
    }

    pub fn component_params(&self) -> ComponentParams {
        self.params
            .iter()
            .fold(ComponentParams::new(self.name.clone()), |params, (k, v)| {
                params.with(k.clone(), v.clone())
            })
    }

    /// Program and arguments launching one worker for this stage.
    pub fn worker_command(&self) -> Result<(PathBuf, Vec<String>), ConfigurationError> {
        let program = match &self.command {
            Some(command) => command.clone(),
            None => std::env::current_exe().map_err(|e| {
                ConfigurationError::invalid(&self.name, format!("cannot locate worker executable: {}", e))
            })?,
        };
        let args = match &self.args {
            Some(args) => args.clone(),
            None => {
                let mut args = vec![
                    WORKER_SUBCOMMAND.to_string(),
                    "--component".to_string(),
                    self.component.clone(),
                ];
                for (key, value) in &self.params {
                    args.push("--param".to_string());
                    args.push(format!("{}={}", key, value));
                }
                args
            }
        };
        Ok((program, args))
    }
}

impl CpeDescriptor {
    /// An engine builder with the reader and every stage resolved through
    /// `registry`. Listeners may still be added.
    pub fn engine_builder(&self, registry: &ComponentRegistry) -> Result<CpmEngineBuilder, ConfigurationError> {
        let reader_params = self
            .reader
            .params
            .iter()
            .fold(ComponentParams::new(self.reader.component.clone()), |params, (k, v)| {
                params.with(k.clone(), v.clone())
            });
        let reader = registry.reader(&self.reader.component, &reader_params)?;

        let mut builder = CpmEngine::builder()
            .config(self.cpe.to_cpm_config(&self.checkpoint))
            .boxed_reader(reader);

        for stage in &self.processors {
            let config = stage.to_container_config();
            builder = match stage.deployment {
                DeploymentKind::Integrated => {
                    let factory = registry.processor_factory(&stage.component, &stage.component_params())?;
                    builder.integrated_stage(config, factory)
                }
                DeploymentKind::Fenced => {
                    if stage.command.is_none() && !registry.has_processor(&stage.component) {
                        return Err(ConfigurationError::UnknownComponent(stage.component.clone()));
                    }
                    let (program, args) = stage.worker_command()?;
                    let controller = LocalProcessController::new(program).with_args(args);
                    builder.fenced_stage(config, Arc::new(controller))
                }
            };
        }
        Ok(builder)
    }

    pub fn build_engine(&self, registry: &ComponentRegistry) -> Result<CpmEngine, ConfigurationError> {
        self.engine_builder(registry)?.build()
    }
}
