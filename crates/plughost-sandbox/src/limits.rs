//! Resource metrics, snapshots and threshold evaluation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;

/// One of the four metrics the sandbox accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Memory,
    Cpu,
    Disk,
    Processes,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Memory, Metric::Cpu, Metric::Disk, Metric::Processes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Disk => "disk",
            Self::Processes => "processes",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time (or peak) resource usage of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resident memory of all owned process trees, MiB.
    pub memory_mb: f64,
    /// Accumulated CPU time (user + system), seconds.
    pub cpu_seconds: f64,
    /// Size of the scratch tree, MiB.
    pub disk_mb: f64,
    /// Live processes in owned trees.
    pub process_count: u32,
}

impl ResourceSnapshot {
    /// Fold `other` into `self`, keeping the maximum of every metric.
    pub fn absorb(&mut self, other: &ResourceSnapshot) {
        self.memory_mb = self.memory_mb.max(other.memory_mb);
        self.cpu_seconds = self.cpu_seconds.max(other.cpu_seconds);
        self.disk_mb = self.disk_mb.max(other.disk_mb);
        self.process_count = self.process_count.max(other.process_count);
    }

    /// Value of one metric, as a float.
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Memory => self.memory_mb,
            Metric::Cpu => self.cpu_seconds,
            Metric::Disk => self.disk_mb,
            Metric::Processes => f64::from(self.process_count),
        }
    }
}

/// Result of comparing a snapshot against its limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheck {
    /// `false` iff at least one metric is over its threshold.
    pub valid: bool,
    /// Every offending metric, in [`Metric::ALL`] order.
    pub violated: Vec<Metric>,
    pub snapshot: ResourceSnapshot,
}

impl LimitCheck {
    /// Pure comparison.  A metric violates its limit when it is strictly
    /// greater than a non-zero threshold.
    pub fn evaluate(snapshot: &ResourceSnapshot, limits: &ResourceLimits) -> Self {
        let violated: Vec<Metric> = Metric::ALL
            .into_iter()
            .filter(|metric| {
                threshold(limits, *metric).is_some_and(|max| snapshot.value(*metric) > max)
            })
            .collect();

        Self {
            valid: violated.is_empty(),
            violated,
            snapshot: *snapshot,
        }
    }

    /// Human-readable explanation for each violation.
    pub fn reasons(&self, limits: &ResourceLimits) -> Vec<(Metric, String)> {
        self.violated
            .iter()
            .map(|metric| (*metric, describe(*metric, &self.snapshot, limits)))
            .collect()
    }
}

/// Configured threshold for `metric`, or `None` when unlimited.
pub fn threshold(limits: &ResourceLimits, metric: Metric) -> Option<f64> {
    let raw = match metric {
        Metric::Memory => limits.max_memory_mb,
        Metric::Cpu => limits.max_cpu_seconds,
        Metric::Disk => limits.max_disk_mb,
        Metric::Processes => u64::from(limits.max_processes),
    };
    (raw > 0).then_some(raw as f64)
}

fn describe(metric: Metric, snapshot: &ResourceSnapshot, limits: &ResourceLimits) -> String {
    match metric {
        Metric::Memory => format!(
            "memory {:.1} MB exceeds limit of {} MB",
            snapshot.memory_mb, limits.max_memory_mb
        ),
        Metric::Cpu => format!(
            "cpu time {:.2}s exceeds limit of {}s",
            snapshot.cpu_seconds, limits.max_cpu_seconds
        ),
        Metric::Disk => format!(
            "disk usage {:.1} MB exceeds limit of {} MB",
            snapshot.disk_mb, limits.max_disk_mb
        ),
        Metric::Processes => format!(
            "{} processes exceed limit of {}",
            snapshot.process_count, limits.max_processes
        ),
    }
}
