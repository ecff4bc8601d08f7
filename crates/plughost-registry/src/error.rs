//! Registry error types.
//!
//! Every fallible registry operation returns [`RegistryError`].  Read-only
//! lookups (`get`, `search`, index queries) never fail; only persistence can.

use std::path::PathBuf;

/// Unified error type for the plugin registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Reading or writing the catalog file failed.
    #[error("registry io error at `{path}`: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The catalog document as a whole could not be encoded or decoded.
    #[error("registry json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The cross-process advisory lock could not be acquired.
    #[error("failed to lock registry `{path}`: {reason}")]
    Lock {
        /// Path of the lock file.
        path: PathBuf,
        /// Human-readable description of what went wrong.
        reason: String,
    },

    /// The referenced plugin is not registered.
    #[error("plugin not registered: `{0}`")]
    NotFound(String),
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the registry crate.
pub type Result<T> = std::result::Result<T, RegistryError>;
