//! PlugHost process sandbox.
//!
//! Runs untrusted plugin code as ordinary OS processes with best-effort
//! resource limits.  This is defence in depth, not a security boundary: no
//! namespaces or cgroups are involved.
//!
//! - **[`config`]** -- [`ResourceLimits`] and [`SandboxConfig`].
//! - **[`session`]** -- [`SessionId`] and the per-session scratch tree.
//! - **[`platform`]** -- the [`ResourceLimiter`] trait, its `rlimit` and
//!   no-op backends, and the [`Enforcement`] report.
//! - **[`limits`]** -- [`ResourceSnapshot`] and the pure [`LimitCheck`].
//! - **[`sandbox`]** -- [`Sandbox`]: create sessions, `run`, `spawn`,
//!   `check_limits`, `cleanup`.
//!
//! On unix, children lead their own process group so timeouts and limit
//! violations take down the whole tree.

pub mod command;
pub mod config;
pub mod error;
pub mod limits;
mod monitor;
pub mod outcome;
pub mod platform;
pub mod sandbox;
pub mod session;

pub use command::CommandSpec;
pub use config::{ResourceLimits, SandboxConfig};
pub use error::{Result, SandboxError};
pub use limits::{LimitCheck, Metric, ResourceSnapshot};
pub use outcome::{FailureKind, RunOutcome};
pub use platform::{
    Enforcement, NoopLimiter, ResourceLimiter, Termination, default_limiter, signal_group,
    terminate_group,
};
#[cfg(unix)]
pub use platform::RlimitLimiter;
pub use sandbox::Sandbox;
pub use session::{SCRATCH_DIRS, SessionId, SessionInfo};
