//! Performance reporting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::state::RunState;
use crate::container::{ContainerHealth, ContainerStatsSnapshot, ProcessingContainer};
use crate::deployer::DeploymentKind;

/// Engine-wide entity counters.
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub read: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
}

impl EngineCounters {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Per-container section of a [`PerformanceReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerReport {
    pub name: String,
    pub deployment: DeploymentKind,
    pub health: ContainerHealth,
    /// Instances currently owned by the pool.
    pub instances: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub stats: ContainerStatsSnapshot,
}

impl ContainerReport {
    pub(crate) fn of(container: &ProcessingContainer) -> Self {
        let pool = container.pool_stats();
        Self {
            name: container.name().to_string(),
            deployment: container.deployment(),
            health: container.health(),
            instances: pool.total,
            in_use: pool.checked_out,
            peak_in_use: pool.peak_checked_out,
            stats: container.stats(),
        }
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub name: String,
    pub state: RunState,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub entities_read: u64,
    /// Entities whose traversal ended, successfully or not.
    pub entities_completed: u64,
    pub entities_failed: u64,
    pub entities_retried: u64,
    pub containers: Vec<ContainerReport>,
}

impl PerformanceReport {
    pub(crate) fn collect(
        name: &str,
        state: RunState,
        elapsed: Duration,
        counters: &EngineCounters,
        containers: &[ProcessingContainer],
    ) -> Self {
        Self {
            name: name.to_string(),
            state,
            elapsed,
            entities_read: counters.read.load(Ordering::Relaxed),
            entities_completed: counters.completed.load(Ordering::Relaxed),
            entities_failed: counters.failed.load(Ordering::Relaxed),
            entities_retried: counters.retried.load(Ordering::Relaxed),
            containers: containers.iter().map(ContainerReport::of).collect(),
        }
    }

    /// Completed entities per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.entities_completed as f64 / secs
        }
    }

    pub fn container(&self, name: &str) -> Option<&ContainerReport> {
        self.containers.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CPE '{}' {} after {:.1}s",
            self.name,
            self.state,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(f, "─────────────────────────────────────────")?;
        writeln!(
            f,
            "Entities: {} read, {} completed ({:.1}/s), {} failed, {} retried",
            self.entities_read,
            self.entities_completed,
            self.throughput(),
            self.entities_failed,
            self.entities_retried
        )?;
        writeln!(f)?;

        for c in &self.containers {
            writeln!(
                f,
                "{} [{}, {}] instances={} peak={}",
                c.name, c.deployment, c.health, c.instances, c.peak_in_use
            )?;
            writeln!(
                f,
                "  processed={} failed={} timeouts={} skipped={} restarts={}",
                c.stats.processed, c.stats.failed, c.stats.timeouts, c.stats.skipped, c.stats.restarts
            )?;
            writeln!(
                f,
                "  time={}ms (mean {:.2}ms) sent={} received={}",
                c.stats.processing_ms,
                c.stats.mean_call_ms(),
                format_bytes(c.stats.bytes_sent),
                format_bytes(c.stats.bytes_received)
            )?;
        }
        Ok(())
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} B", bytes)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
