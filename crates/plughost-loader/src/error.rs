//! Error types for the loader.

use std::path::PathBuf;

use plughost_registry::RegistryError;

/// Loader-specific errors.
///
/// Whatever the variant, a failed install leaves nothing behind: no staged
/// files and no registry entry.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The manifest is missing, unparsable, or lacks a required field.
    #[error("invalid manifest at `{path}`: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// The manifest parsed but does not match the files on disk.
    #[error("validation failed for plugin `{plugin_id}`: {reason}")]
    Validation { plugin_id: String, reason: String },

    /// Clone, pull or file staging failed.
    #[error("install failed: {0}")]
    Install(String),

    #[error("plugin `{id}` is already installed (use force to overwrite)")]
    AlreadyInstalled { id: String },

    /// The source string is not an allowed git URL or ref.
    #[error("unsupported source `{source_str}`: {reason}")]
    UnsupportedSource { source_str: String, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    pub(crate) fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, LoaderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_names_plugin() {
        let err = LoaderError::validation("echo", "entry point `main` -> `missing.py` not found");
        assert_eq!(
            err.to_string(),
            "validation failed for plugin `echo`: entry point `main` -> `missing.py` not found"
        );
    }

    #[test]
    fn registry_error_converts() {
        let err: LoaderError = RegistryError::NotFound("x".into()).into();
        assert!(matches!(err, LoaderError::Registry(_)));
    }
}
