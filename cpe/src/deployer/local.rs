use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ProcessController;
use crate::error::DeploymentError;
use crate::transport::Endpoint;

/// Line a worker prints on stdout once it is accepting connections.
pub const LISTENING_PREFIX: &str = "LISTENING ";

/// How long a worker may take to announce its address.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Launches fenced workers as child processes.
///
/// The worker command must print `LISTENING <host:port>` on stdout when ready.
/// Remaining stdout lines are forwarded to the debug log. Undeploy kills and
/// reaps the child.
pub struct LocalProcessController {
    program: PathBuf,
    args: Vec<OsString>,
    startup_timeout: Duration,
    children: Mutex<HashMap<Endpoint, Child>>,
}

impl LocalProcessController {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Number of running children.
    pub fn running(&self) -> usize {
        self.children.lock().len()
    }

    fn launch_one(&self, stage: &str) -> Result<(Endpoint, Child), DeploymentError> {
        let launch_error = |reason: String| DeploymentError::Launch {
            stage: stage.to_string(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| launch_error(format!("{}: {}", self.program.display(), e)))?;

        let Some(stdout) = child.stdout.take() else {
            kill(&mut child);
            return Err(launch_error("worker stdout unavailable".to_string()));
        };

        let (tx, rx) = mpsc::channel();
        let pid = child.id();
        let reader = thread::Builder::new()
            .name(format!("cpe-worker-stdout-{}", pid))
            .spawn(move || {
                let mut announced = false;
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    match line.strip_prefix(LISTENING_PREFIX) {
                        Some(address) if !announced => {
                            announced = true;
                            let _ = tx.send(address.trim().to_string());
                        }
                        _ => debug!(pid = pid, line = %line, "Worker output"),
                    }
                }
            });
        if let Err(e) = reader {
            kill(&mut child);
            return Err(launch_error(format!("failed to watch worker output: {}", e)));
        }

        let address = match rx.recv_timeout(self.startup_timeout) {
            Ok(address) => address,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                kill(&mut child);
                return Err(launch_error(format!(
                    "worker did not announce an address within {:?}",
                    self.startup_timeout
                )));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                let status = child.wait().ok();
                return Err(launch_error(format!(
                    "worker exited before announcing an address ({:?})",
                    status
                )));
            }
        };

        match Endpoint::parse(&address) {
            Some(endpoint) => Ok((endpoint, child)),
            None => {
                kill(&mut child);
                Err(launch_error(format!("worker announced invalid address '{}'", address)))
            }
        }
    }
}

impl ProcessController for LocalProcessController {
    fn deploy(&self, stage: &str, count: usize) -> Result<Vec<Endpoint>, DeploymentError> {
        let mut launched = Vec::with_capacity(count);
        for _ in 0..count {
            match self.launch_one(stage) {
                Ok(worker) => launched.push(worker),
                Err(e) => {
                    for (_, mut child) in launched {
                        kill(&mut child);
                    }
                    return Err(e);
                }
            }
        }

        let mut children = self.children.lock();
        let endpoints = launched
            .into_iter()
            .map(|(endpoint, child)| {
                info!(stage = stage, endpoint = %endpoint, pid = child.id(), "Worker started");
                children.insert(endpoint.clone(), child);
                endpoint
            })
            .collect();
        Ok(endpoints)
    }

    fn undeploy(&self, endpoint: &Endpoint) -> Result<(), DeploymentError> {
        let mut child = self
            .children
            .lock()
            .remove(endpoint)
            .ok_or_else(|| DeploymentError::UnknownEndpoint(endpoint.clone()))?;
        kill(&mut child);
        debug!(endpoint = %endpoint, "Worker stopped");
        Ok(())
    }
}

impl Drop for LocalProcessController {
    fn drop(&mut self) {
        for (endpoint, mut child) in self.children.lock().drain() {
            warn!(endpoint = %endpoint, "Killing worker left running at shutdown");
            kill(&mut child);
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
