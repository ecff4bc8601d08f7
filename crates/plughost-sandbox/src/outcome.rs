//! Results of a sandboxed run and how exits are classified.

use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;
use crate::error::{Result, SandboxError};
use crate::limits::{Metric, ResourceSnapshot};
use crate::platform::{self, Enforcement, signals};

/// Allocation-failure messages printed by common runtimes and libc users.
const MEMORY_MARKERS: &[&str] = &[
    "memory exhausted",
    "MemoryError",
    "Cannot allocate memory",
    "out of memory",
    "Out of memory",
    "bad_alloc",
    "memory allocation of",
    "JavaScript heap out of memory",
];

/// Why a run did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The wall-clock timeout expired; the tree was killed.
    Timeout { seconds: f64 },
    /// A resource limit was hit, either by the OS or by the monitor.
    LimitExceeded { metric: Metric, reason: String },
    /// The command exited on its own with a non-zero code.
    NonZeroExit { code: i32 },
    /// Killed by a signal that no limit accounts for.
    Signal { signal: i32 },
}

impl FailureKind {
    /// Short human-readable reason.
    pub fn reason(&self) -> String {
        match self {
            Self::Timeout { seconds } => format!("timed out after {seconds:.2}s"),
            Self::LimitExceeded { metric, reason } => {
                format!("resource limit exceeded ({metric}): {reason}")
            }
            Self::NonZeroExit { code } => format!("exited with code {code}"),
            Self::Signal { signal } => format!("killed by signal {signal}"),
        }
    }
}

impl From<FailureKind> for SandboxError {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout { seconds } => Self::Timeout { seconds },
            FailureKind::LimitExceeded { metric, reason } => Self::LimitExceeded { metric, reason },
            FailureKind::NonZeroExit { code } => Self::NonZeroExit { code },
            FailureKind::Signal { signal } => Self::Killed { signal },
        }
    }
}

/// Everything observed about one `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// `true` iff `failure` is `None`.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when the process was killed by a signal.
    pub return_code: Option<i32>,
    /// Peak usage observed while the command ran.
    pub resource_usage: ResourceSnapshot,
    pub failure: Option<FailureKind>,
    /// What the OS actually enforced for this run.
    pub enforcement: Enforcement,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl RunOutcome {
    /// Convert a failed outcome into the matching [`SandboxError`].
    pub fn into_result(self) -> Result<Self> {
        match self.failure.clone() {
            Some(kind) => Err(kind.into()),
            None => Ok(self),
        }
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(FailureKind::reason)
    }
}

/// Fraction of a limit that peak usage must reach before a crash is
/// attributed to that limit.
const NEAR_LIMIT: f64 = 0.9;

/// Classify a process that exited on its own (not killed by the host).
///
/// A crash only counts as a limit violation when there is evidence for it:
/// a limit-specific signal, peak usage near the limit, or an allocation
/// failure on stderr.  Everything else is the command's own failure.
pub(crate) fn classify_exit(
    status: &ExitStatus,
    stderr: &str,
    limits: &ResourceLimits,
    enforcement: &Enforcement,
    peak: &ResourceSnapshot,
) -> Option<FailureKind> {
    if status.success() {
        return None;
    }

    let evidence = Evidence {
        stderr,
        limits,
        enforcement,
        peak,
    };

    if let Some(signal) = platform::exit_signal(status) {
        return Some(
            evidence
                .signal(signal, Origin::Kernel)
                .unwrap_or(FailureKind::Signal { signal }),
        );
    }

    let code = status.code().unwrap_or(-1);

    // Shells report a child killed by signal N as exit code 128 + N, but a
    // command may also exit with such a code deliberately.
    if code > 128 {
        if let Some(kind) = evidence.signal(code - 128, Origin::ExitCode) {
            return Some(kind);
        }
    }

    if enforcement.memory && evidence.allocation_failed() {
        return Some(FailureKind::LimitExceeded {
            metric: Metric::Memory,
            reason: format!(
                "allocation failed under {} MB memory limit",
                limits.max_memory_mb
            ),
        });
    }

    Some(FailureKind::NonZeroExit { code })
}

/// Where a signal number came from.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// The process itself was terminated by the signal.
    Kernel,
    /// Decoded from a `128 + N` exit code.
    ExitCode,
}

struct Evidence<'a> {
    stderr: &'a str,
    limits: &'a ResourceLimits,
    enforcement: &'a Enforcement,
    peak: &'a ResourceSnapshot,
}

impl Evidence<'_> {
    fn allocation_failed(&self) -> bool {
        MEMORY_MARKERS.iter().any(|m| self.stderr.contains(m))
    }

    fn near(&self, metric: Metric, limit: u64) -> bool {
        limit > 0 && self.peak.value(metric) >= limit as f64 * NEAR_LIMIT
    }

    fn signal(&self, signal: i32, origin: Origin) -> Option<FailureKind> {
        let limits = self.limits;
        let enforcement = self.enforcement;
        let limit = |metric: Metric, reason: String| Some(FailureKind::LimitExceeded { metric, reason });

        // SIGXCPU and SIGXFSZ are only raised by the kernel for rlimits, so
        // a real signal is proof on its own.  A decoded exit code is not.
        let trusted = origin == Origin::Kernel;

        match signal {
            s if s == signals::SIGXCPU
                && enforcement.cpu
                && (trusted || self.near(Metric::Cpu, limits.max_cpu_seconds)) =>
            {
                limit(
                    Metric::Cpu,
                    format!("cpu time limit of {}s exceeded", limits.max_cpu_seconds),
                )
            }
            s if s == signals::SIGXFSZ
                && enforcement.disk
                && (trusted || self.near(Metric::Disk, limits.max_disk_mb)) =>
            {
                limit(
                    Metric::Disk,
                    format!("file size limit of {} MB exceeded", limits.max_disk_mb),
                )
            }
            s if s == signals::SIGKILL
                && enforcement.cpu
                && limits.max_cpu_seconds > 0
                && self.peak.cpu_seconds >= limits.max_cpu_seconds as f64 =>
            {
                limit(
                    Metric::Cpu,
                    format!("cpu time hard limit of {}s exceeded", limits.max_cpu_seconds + 1),
                )
            }
            s if (s == signals::SIGSEGV || s == signals::SIGABRT || s == signals::SIGKILL)
                && enforcement.memory
                && (self.allocation_failed() || self.near(Metric::Memory, limits.max_memory_mb)) =>
            {
                limit(
                    Metric::Memory,
                    format!(
                        "terminated by signal {s} under {} MB memory limit",
                        limits.max_memory_mb
                    ),
                )
            }
            _ => None,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn enforced() -> Enforcement {
        Enforcement {
            backend: "rlimit".into(),
            memory: true,
            cpu: true,
            disk: true,
            processes: false,
            network: false,
        }
    }

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signalled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    #[test]
    fn success_is_not_a_failure() {
        let peak = ResourceSnapshot::default();
        assert!(classify_exit(&exited(0), "", &ResourceLimits::default(), &enforced(), &peak).is_none());
    }

    #[test]
    fn plain_non_zero_exit() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(&exited(3), "boom", &ResourceLimits::default(), &enforced(), &peak);
        assert_eq!(kind, Some(FailureKind::NonZeroExit { code: 3 }));
    }

    #[test]
    fn allocation_marker_means_memory() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &exited(1),
            "dd: memory exhausted by input buffer of size 268435456 bytes",
            &ResourceLimits::default(),
            &enforced(),
            &peak,
        );
        assert!(matches!(
            kind,
            Some(FailureKind::LimitExceeded { metric: Metric::Memory, .. })
        ));
    }

    #[test]
    fn allocation_marker_ignored_without_enforcement() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &exited(1),
            "MemoryError",
            &ResourceLimits::default(),
            &Enforcement::none("none"),
            &peak,
        );
        assert_eq!(kind, Some(FailureKind::NonZeroExit { code: 1 }));
    }

    #[test]
    fn sigxfsz_means_disk() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &signalled(libc::SIGXFSZ),
            "",
            &ResourceLimits::default(),
            &enforced(),
            &peak,
        );
        assert!(matches!(
            kind,
            Some(FailureKind::LimitExceeded { metric: Metric::Disk, .. })
        ));
    }

    #[test]
    fn shell_reported_sigxcpu_means_cpu() {
        let limits = ResourceLimits::default().with_max_cpu_seconds(2);
        let peak = ResourceSnapshot {
            cpu_seconds: 2.0,
            ..ResourceSnapshot::default()
        };
        let kind = classify_exit(
            &exited(128 + libc::SIGXCPU),
            "",
            &limits,
            &enforced(),
            &peak,
        );
        assert!(matches!(
            kind,
            Some(FailureKind::LimitExceeded { metric: Metric::Cpu, .. })
        ));
    }

    #[test]
    fn shell_reported_sigxcpu_without_cpu_use_is_an_exit() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &exited(128 + libc::SIGXCPU),
            "",
            &ResourceLimits::default(),
            &enforced(),
            &peak,
        );
        assert_eq!(kind, Some(FailureKind::NonZeroExit { code: 128 + libc::SIGXCPU }));
    }

    #[test]
    fn segfault_without_memory_pressure_is_a_signal() {
        let peak = ResourceSnapshot::default();
        for signal in [libc::SIGSEGV, libc::SIGABRT, libc::SIGKILL] {
            let kind = classify_exit(
                &signalled(signal),
                "",
                &ResourceLimits::default(),
                &enforced(),
                &peak,
            );
            assert_eq!(kind, Some(FailureKind::Signal { signal }));
        }
    }

    #[test]
    fn exit_137_without_memory_pressure_is_an_exit() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(&exited(137), "", &ResourceLimits::default(), &enforced(), &peak);
        assert_eq!(kind, Some(FailureKind::NonZeroExit { code: 137 }));
    }

    #[test]
    fn segfault_near_memory_limit_means_memory() {
        let limits = ResourceLimits::default().with_max_memory_mb(100);
        let peak = ResourceSnapshot {
            memory_mb: 95.0,
            ..ResourceSnapshot::default()
        };
        let kind = classify_exit(&signalled(libc::SIGSEGV), "", &limits, &enforced(), &peak);
        assert!(matches!(
            kind,
            Some(FailureKind::LimitExceeded { metric: Metric::Memory, .. })
        ));
    }

    #[test]
    fn abort_after_allocation_failure_means_memory() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &signalled(libc::SIGABRT),
            "memory allocation of 1048576 bytes failed",
            &ResourceLimits::default(),
            &enforced(),
            &peak,
        );
        assert!(matches!(
            kind,
            Some(FailureKind::LimitExceeded { metric: Metric::Memory, .. })
        ));
    }

    #[test]
    fn unrelated_signal_is_reported_as_signal() {
        let peak = ResourceSnapshot::default();
        let kind = classify_exit(
            &signalled(libc::SIGTERM),
            "",
            &ResourceLimits::default(),
            &enforced(),
            &peak,
        );
        assert_eq!(kind, Some(FailureKind::Signal { signal: libc::SIGTERM }));
    }

    #[test]
    fn failure_converts_to_error() {
        let err: SandboxError = FailureKind::NonZeroExit { code: 2 }.into();
        assert!(matches!(err, SandboxError::NonZeroExit { code: 2 }));
    }
}
