//! Platform-specific process control.
//!
//! Resource limits are applied through a [`ResourceLimiter`] backend chosen
//! at construction time.  Every backend reports, per metric, whether it
//! actually enforces the limit ([`Enforcement`]); metrics it does not
//! enforce are still monitored by the sampling loop.
//!
//! The unix backend uses `setrlimit` in a `pre_exec` hook:
//!
//! | metric    | mechanism                       |
//! |-----------|---------------------------------|
//! | memory    | `RLIMIT_AS`                     |
//! | cpu       | `RLIMIT_CPU` (SIGXCPU, SIGKILL) |
//! | disk      | `RLIMIT_FSIZE` (SIGXFSZ)        |
//! | processes | monitored only                  |
//! | network   | advisory env var only           |
//!
//! `RLIMIT_NPROC` counts every process of the user, not just the child's
//! tree, so it is deliberately left alone.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;
use crate::limits::Metric;

#[cfg(unix)]
const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Enforcement report
// ---------------------------------------------------------------------------

/// Which limits the active backend enforces at the OS level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enforcement {
    /// Backend name, e.g. `rlimit` or `none`.
    pub backend: String,
    pub memory: bool,
    pub cpu: bool,
    pub disk: bool,
    pub processes: bool,
    pub network: bool,
}

impl Enforcement {
    /// Nothing enforced.
    pub fn none(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            memory: false,
            cpu: false,
            disk: false,
            processes: false,
            network: false,
        }
    }

    pub fn enforces(&self, metric: Metric) -> bool {
        match metric {
            Metric::Memory => self.memory,
            Metric::Cpu => self.cpu,
            Metric::Disk => self.disk,
            Metric::Processes => self.processes,
        }
    }

    /// Names of everything that is only monitored or advisory.
    pub fn not_enforced(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Metric::ALL
            .into_iter()
            .filter(|m| !self.enforces(*m))
            .map(|m| m.as_str())
            .collect();
        if !self.network {
            names.push("network");
        }
        names
    }
}

// ---------------------------------------------------------------------------
// Limiter trait and backends
// ---------------------------------------------------------------------------

/// Applies OS-level limits to a command before it is spawned.
pub trait ResourceLimiter: Send + Sync + fmt::Debug {
    /// Short backend name used in logs and reports.
    fn name(&self) -> &'static str;

    /// What [`apply`](Self::apply) will enforce for `limits`.
    fn enforcement(&self, limits: &ResourceLimits) -> Enforcement;

    /// Install the limits on `command`.
    fn apply(&self, command: &mut tokio::process::Command, limits: &ResourceLimits);
}

/// Backend that enforces nothing.  Used on platforms without rlimits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {
    fn name(&self) -> &'static str {
        "none"
    }

    fn enforcement(&self, _limits: &ResourceLimits) -> Enforcement {
        Enforcement::none(self.name())
    }

    fn apply(&self, _command: &mut tokio::process::Command, _limits: &ResourceLimits) {}
}

/// POSIX `setrlimit` backend.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RlimitLimiter;

#[cfg(unix)]
impl ResourceLimiter for RlimitLimiter {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    fn enforcement(&self, limits: &ResourceLimits) -> Enforcement {
        Enforcement {
            backend: self.name().to_owned(),
            memory: limits.max_memory_mb > 0,
            cpu: limits.max_cpu_seconds > 0,
            disk: limits.max_disk_mb > 0,
            processes: false,
            network: false,
        }
    }

    fn apply(&self, command: &mut tokio::process::Command, limits: &ResourceLimits) {
        let plan = RlimitPlan::from_limits(limits);

        // SAFETY: the hook runs between fork and exec.  It only performs
        // `setrlimit` syscalls on values computed before the fork and reads
        // errno on failure; no allocation, no locks.
        unsafe {
            command.pre_exec(move || plan.install());
        }
    }
}

/// Values computed in the parent so the `pre_exec` hook stays
/// async-signal-safe.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    address_space: Option<u64>,
    cpu_seconds: Option<u64>,
    file_size: Option<u64>,
}

#[cfg(unix)]
impl RlimitPlan {
    fn from_limits(limits: &ResourceLimits) -> Self {
        let nonzero = |v: u64| (v > 0).then_some(v);
        Self {
            address_space: nonzero(limits.max_memory_mb).map(|mb| mb.saturating_mul(MIB)),
            cpu_seconds: nonzero(limits.max_cpu_seconds),
            file_size: nonzero(limits.max_disk_mb).map(|mb| mb.saturating_mul(MIB)),
        }
    }

    fn install(&self) -> std::io::Result<()> {
        if let Some(bytes) = self.address_space {
            set_rlimit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(seconds) = self.cpu_seconds {
            // Soft limit delivers SIGXCPU, the hard limit one second later
            // delivers SIGKILL to processes that ignore it.
            set_rlimit(libc::RLIMIT_CPU, seconds, seconds.saturating_add(1))?;
        }
        if let Some(bytes) = self.file_size {
            set_rlimit(libc::RLIMIT_FSIZE, bytes, bytes)?;
        }
        Ok(())
    }
}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;

#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialised rlimit on the stack.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The limiter for the current platform.
pub fn default_limiter() -> Arc<dyn ResourceLimiter> {
    #[cfg(unix)]
    {
        Arc::new(RlimitLimiter)
    }
    #[cfg(not(unix))]
    {
        Arc::new(NoopLimiter)
    }
}

// ---------------------------------------------------------------------------
// Process-group signals
// ---------------------------------------------------------------------------

/// How hard to ask a process group to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forceful,
}

/// Signal every process in the group led by `pgid`.  Returns `false` if the
/// group no longer exists.
#[cfg(unix)]
pub fn signal_group(pgid: u32, how: Termination) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    let signal = match how {
        Termination::Graceful => libc::SIGTERM,
        Termination::Forceful => libc::SIGKILL,
    };
    // SAFETY: plain syscall; a negative pid addresses the process group.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _how: Termination) -> bool {
    false
}

/// Whether any process of the group led by `pgid` is still around.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    // SAFETY: signal 0 only performs the permission / existence check.
    unsafe { libc::kill(-pgid, 0) == 0 }
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL whatever is left.
pub async fn terminate_group(pgid: u32, grace: std::time::Duration) {
    if !signal_group(pgid, Termination::Graceful) {
        return;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while group_alive(pgid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    if group_alive(pgid) {
        tracing::debug!(pgid, "process group ignored SIGTERM, sending SIGKILL");
        signal_group(pgid, Termination::Forceful);
    }
}

// ---------------------------------------------------------------------------
// CPU accounting
// ---------------------------------------------------------------------------

/// User + system CPU seconds consumed by `pid`, from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
pub(crate) fn cpu_seconds(pid: u32) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / clock_ticks_per_second())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_seconds(_pid: u32) -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

// ---------------------------------------------------------------------------
// Exit classification helpers
// ---------------------------------------------------------------------------

/// Signal that terminated the process, if any.
#[cfg(unix)]
pub(crate) fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub(crate) fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Named signals the classifier cares about.
pub(crate) mod signals {
    #[cfg(unix)]
    pub const SIGKILL: i32 = libc::SIGKILL;
    #[cfg(unix)]
    pub const SIGXCPU: i32 = libc::SIGXCPU;
    #[cfg(unix)]
    pub const SIGXFSZ: i32 = libc::SIGXFSZ;
    #[cfg(unix)]
    pub const SIGSEGV: i32 = libc::SIGSEGV;
    #[cfg(unix)]
    pub const SIGABRT: i32 = libc::SIGABRT;

    #[cfg(not(unix))]
    pub const SIGKILL: i32 = 9;
    #[cfg(not(unix))]
    pub const SIGXCPU: i32 = 24;
    #[cfg(not(unix))]
    pub const SIGXFSZ: i32 = 25;
    #[cfg(not(unix))]
    pub const SIGSEGV: i32 = 11;
    #[cfg(not(unix))]
    pub const SIGABRT: i32 = 6;
}
