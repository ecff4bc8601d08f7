//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`].  The
//! variants keep timeouts, limit violations and the plugin's own non-zero
//! exit apart so callers can react to each differently.

use crate::limits::Metric;
use crate::session::SessionId;

/// Unified error type for the process sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The session id is unknown or the session was already cleaned up.
    #[error("sandbox session not found: {0}")]
    SessionNotFound(SessionId),

    /// The command could not be described (e.g. an empty argv).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The child process could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A monitored or OS-enforced resource limit was exceeded.
    #[error("resource limit exceeded ({metric}): {reason}")]
    LimitExceeded {
        /// The offending metric.
        metric: Metric,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// The wall-clock timeout elapsed and the process tree was killed.
    #[error("timed out after {seconds:.2}s")]
    Timeout {
        /// The configured timeout in seconds.
        seconds: f64,
    },

    /// The process exited on its own with a non-zero status.
    #[error("process exited with code {code}")]
    NonZeroExit {
        /// Exit code reported by the OS.
        code: i32,
    },

    /// The process was terminated by a signal unrelated to any limit.
    #[error("process killed by signal {signal}")]
    Killed {
        /// Signal number.
        signal: i32,
    },

    /// Filesystem error while managing the scratch tree.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
