//! Worker command - serve one stage type over the fenced worker protocol.
//!
//! Launched by the engine for `deployment = fenced` stages. Announces its
//! address on stdout with the `LISTENING` line and then serves until killed.

use std::io::Write;
use std::sync::Arc;

use cpe::components::{ComponentParams, ComponentRegistry};
use cpe::deployer::LISTENING_PREFIX;
use cpe::logging::init_worker_logging;
use cpe::transport::{JsonCasCodec, WorkerServer};
use tracing::info;

use crate::error::CliError;

/// Arguments for the worker command.
pub struct WorkerArgs {
    pub component: String,
    pub listen: String,
    pub params: Vec<(String, String)>,
}

/// Parse a `key=value` component parameter.
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

/// Run the worker command.
pub fn run(args: WorkerArgs) -> Result<(), CliError> {
    init_worker_logging();

    let params = args
        .params
        .iter()
        .fold(ComponentParams::new(args.component.clone()), |params, (k, v)| {
            params.with(k.clone(), v.clone())
        });
    let factory = ComponentRegistry::with_builtins().processor_factory(&args.component, &params)?;

    let server = WorkerServer::bind(args.listen.as_str(), factory, Arc::new(JsonCasCodec))
        .map_err(|error| CliError::WorkerBind {
            addr: args.listen.clone(),
            error,
        })?;
    info!(component = %args.component, addr = %server.local_addr(), "Worker ready");

    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}{}", LISTENING_PREFIX, server.local_addr());
    let _ = stdout.flush();
    drop(stdout);

    server.wait();
    Ok(())
}
