//! Sandbox configuration.
//!
//! [`ResourceLimits`] are the per-session thresholds; [`SandboxConfig`] adds
//! the host-side knobs (scratch location, sampling cadence, kill grace).
//! Both provide sensible defaults and builder-style setters.
//!
//! A limit of `0` means "unlimited" for that metric.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-session resource thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space / resident memory ceiling in MiB.
    ///
    /// Default: **512**.
    pub max_memory_mb: u64,

    /// Accumulated CPU time in seconds.
    ///
    /// Default: **60**.
    pub max_cpu_seconds: u64,

    /// Scratch directory usage (and largest single file) in MiB.
    ///
    /// Default: **1024**.
    pub max_disk_mb: u64,

    /// Live processes in an owned process tree.  Monitored, never enforced
    /// by the OS.
    ///
    /// Default: **16**.
    pub max_processes: u32,

    /// Whether plugins may use the network.  Advisory only.
    ///
    /// Default: **false**.
    pub allow_network: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_seconds: 60,
            max_disk_mb: 1024,
            max_processes: 16,
            allow_network: false,
        }
    }
}

impl ResourceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_max_cpu_seconds(mut self, seconds: u64) -> Self {
        self.max_cpu_seconds = seconds;
        self
    }

    pub fn with_max_disk_mb(mut self, mb: u64) -> Self {
        self.max_disk_mb = mb;
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = count;
        self
    }

    pub fn with_allow_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }
}

/// Host-side sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which every session gets its scratch tree.
    ///
    /// Default: `$TMPDIR/plughost-sandbox`.
    pub base_dir: PathBuf,

    /// Limits applied to sessions created without explicit limits.
    pub limits: ResourceLimits,

    /// Time between SIGTERM and SIGKILL when tearing a process tree down.
    ///
    /// Default: **2 s**.
    pub kill_grace: Duration,

    /// Resource sampling cadence while a `run` is in flight.
    ///
    /// Default: **100 ms**.
    pub sample_interval: Duration,

    /// Captured stdout / stderr are each truncated to this many bytes.
    ///
    /// Default: **100 KiB**.
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("plughost-sandbox"),
            limits: ResourceLimits::default(),
            kill_grace: Duration::from_secs(2),
            sample_interval: Duration::from_millis(100),
            max_output_bytes: 100 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}
