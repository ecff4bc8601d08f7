//! Loader configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Where plugins are installed and how they are fetched.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Root directory; git installs land in `<plugins_dir>/<id>`.
    pub plugins_dir: PathBuf,

    /// Ref cloned when the caller does not name one.
    ///
    /// Default: **`main`**.
    pub default_ref: String,

    /// Upper bound for a single clone or pull.
    ///
    /// Default: **300 s**.
    pub clone_timeout: Duration,

    /// Whether to run the plugin's package manager after install.
    ///
    /// Default: **true**.
    pub install_dependencies: bool,

    /// Upper bound for one package-manager invocation.
    ///
    /// Default: **600 s**.
    pub dependency_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            default_ref: "main".to_owned(),
            clone_timeout: Duration::from_secs(300),
            install_dependencies: true,
            dependency_timeout: Duration::from_secs(600),
        }
    }
}

impl LoaderConfig {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_default_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.default_ref = git_ref.into();
        self
    }

    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }

    pub fn with_install_dependencies(mut self, enabled: bool) -> Self {
        self.install_dependencies = enabled;
        self
    }

    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }
}
