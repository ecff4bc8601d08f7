//! Error types for the executor.
//!
//! These never cross the public `execute*` boundary: the [`Executor`]
//! folds them into a failed [`ExecutionResult`].  They are public so
//! embedders driving [`PluginInstance`] directly can match on them.
//!
//! [`Executor`]: crate::Executor
//! [`ExecutionResult`]: crate::ExecutionResult
//! [`PluginInstance`]: crate::PluginInstance

use plughost_sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin not found: `{0}` is inactive")]
    Inactive(String),

    #[error("procedure `{procedure_id}` not found in plugin `{plugin_id}`")]
    ProcedureNotFound {
        plugin_id: String,
        procedure_id: String,
    },

    /// The plugin process could not be started or initialized.
    #[error("failed to load plugin `{plugin_id}`: {reason}")]
    Load { plugin_id: String, reason: String },

    /// The plugin answered a call with an error.
    #[error("plugin `{plugin_id}` failed: {reason}")]
    Execution { plugin_id: String, reason: String },

    #[error("plugin `{plugin_id}` timed out after {seconds:.2}s")]
    Timeout { plugin_id: String, seconds: f64 },

    /// The plugin broke the wire contract or its process went away.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub(crate) fn load(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the instance that produced this error must be discarded.
    ///
    /// A plugin that reported an error is still healthy; anything on the
    /// transport side leaves the process in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Protocol(_) | Self::Io(_))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ExecutorError>;
