//! Run command - process a collection described by a CPE descriptor.

use std::path::PathBuf;
use std::sync::Arc;

use cpe::components::ComponentRegistry;
use cpe::config::CpeDescriptor;
use cpe::engine::TracingStatusListener;
use cpe::logging::{default_log_file, init_logging};
use tracing::info;

use crate::error::CliError;

/// Arguments for the run command.
pub struct RunArgs {
    pub descriptor: PathBuf,
    pub log_dir: PathBuf,
    pub restore: Option<PathBuf>,
    pub pipelines: Option<usize>,
    pub entity_limit: Option<u64>,
}

/// Load the descriptor without starting anything.
pub fn load_descriptor(args: &RunArgs) -> Result<CpeDescriptor, CliError> {
    let mut descriptor =
        CpeDescriptor::load_from(&args.descriptor).map_err(|error| CliError::Descriptor {
            path: args.descriptor.display().to_string(),
            error,
        })?;

    // Command-line overrides
    if let Some(pipelines) = args.pipelines {
        descriptor.cpe.pipelines = pipelines;
    }
    if let Some(limit) = args.entity_limit {
        descriptor.cpe.entity_limit = limit;
    }
    Ok(descriptor)
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let descriptor = load_descriptor(&args)?;

    let _logging_guard = init_logging(&args.log_dir, default_log_file())
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    info!("CPE v{}", cpe::VERSION);
    info!(
        descriptor = %args.descriptor.display(),
        stages = descriptor.processors.len(),
        "Starting run"
    );

    let engine = descriptor
        .engine_builder(&ComponentRegistry::with_builtins())?
        .listener(Arc::new(TracingStatusListener))
        .build()?;

    if let Some(checkpoint) = &args.restore {
        engine.restore_checkpoint(checkpoint)?;
        info!(checkpoint = %checkpoint.display(), "Restored checkpoint");
    }

    engine.process()?;
    engine.wait();

    let report = engine.get_performance_report();
    println!("{}", report);

    match engine.last_error() {
        Some(error) => Err(CliError::Aborted(error)),
        None => Ok(()),
    }
}
