//! Host configuration.
//!
//! Read from the `--config` file, else `plughost.toml` in the working
//! directory, else built-in defaults.  `PLUGHOST_DATA_DIR` and
//! `PLUGHOST_PLUGINS_DIR` override the paths afterwards.
//!
//! ```toml
//! [paths]
//! data_dir = "data"
//!
//! [sandbox]
//! kill_grace_ms = 2000
//!
//! [sandbox.limits]
//! max_memory_mb = 256
//!
//! [executor]
//! call_timeout_secs = 30
//!
//! [loader]
//! default_ref = "main"
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use plughost_executor::ExecutorConfig;
use plughost_loader::LoaderConfig;
use plughost_sandbox::{ResourceLimits, SandboxConfig};
use serde::{Deserialize, Serialize};

/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "plughost.toml";

pub const DATA_DIR_ENV: &str = "PLUGHOST_DATA_DIR";
pub const PLUGINS_DIR_ENV: &str = "PLUGHOST_PLUGINS_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub paths: PathsConfig,
    pub sandbox: SandboxSection,
    pub executor: ExecutorSection,
    pub loader: LoaderSection,
}

/// `[paths]`.  Unset entries live under `data_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            plugins_dir: None,
            registry_file: None,
        }
    }
}

impl PathsConfig {
    pub fn plugins_dir(&self) -> PathBuf {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("plugins"))
    }

    pub fn registry_file(&self) -> PathBuf {
        self.registry_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("registry.json"))
    }
}

/// `[sandbox]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Scratch root for sessions.  Defaults to `<data_dir>/sandbox`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    pub kill_grace_ms: u64,
    pub sample_interval_ms: u64,
    pub limits: ResourceLimits,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            base_dir: None,
            kill_grace_ms: 2_000,
            sample_interval_ms: 100,
            limits: ResourceLimits::default(),
        }
    }
}

/// `[executor]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub sandboxed: bool,
    pub init_timeout_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            sandboxed: true,
            init_timeout_secs: 30,
            call_timeout_secs: 60,
        }
    }
}

/// `[loader]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSection {
    pub install_dependencies: bool,
    pub clone_timeout_secs: u64,
    pub default_ref: String,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            install_dependencies: true,
            clone_timeout_secs: 300,
            default_ref: "main".to_owned(),
        }
    }
}

impl HostConfig {
    /// Resolve the configuration for this process.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var_os(key));
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply path overrides from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<OsString>) {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(PLUGINS_DIR_ENV).filter(|v| !v.is_empty()) {
            self.paths.plugins_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        let base_dir = self
            .sandbox
            .base_dir
            .clone()
            .unwrap_or_else(|| self.paths.data_dir.join("sandbox"));
        SandboxConfig::default()
            .with_base_dir(base_dir)
            .with_limits(self.sandbox.limits.clone())
            .with_kill_grace(Duration::from_millis(self.sandbox.kill_grace_ms))
            .with_sample_interval(Duration::from_millis(self.sandbox.sample_interval_ms.max(1)))
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig::new(self.paths.plugins_dir())
            .with_default_ref(self.loader.default_ref.clone())
            .with_clone_timeout(Duration::from_secs(self.loader.clone_timeout_secs))
            .with_install_dependencies(self.loader.install_dependencies)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_sandboxed(self.executor.sandboxed)
            .with_init_timeout(Duration::from_secs(self.executor.init_timeout_secs))
            .with_call_timeout(Duration::from_secs(self.executor.call_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_live_under_data_dir() {
        let config = HostConfig::default();
        assert_eq!(config.paths.plugins_dir(), PathBuf::from("data/plugins"));
        assert_eq!(
            config.paths.registry_file(),
            PathBuf::from("data/registry.json")
        );
        assert_eq!(
            config.sandbox_config().base_dir,
            PathBuf::from("data/sandbox")
        );
        assert!(config.executor.sandboxed);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [paths]
            data_dir = "/var/lib/plughost"

            [sandbox.limits]
            max_memory_mb = 128

            [executor]
            call_timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(
            config.paths.plugins_dir(),
            PathBuf::from("/var/lib/plughost/plugins")
        );
        assert_eq!(config.sandbox.limits.max_memory_mb, 128);
        assert_eq!(
            config.sandbox.limits.max_cpu_seconds,
            ResourceLimits::default().max_cpu_seconds
        );
        assert_eq!(
            config.executor_config().call_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.loader.default_ref, "main");
    }

    #[test]
    fn env_overrides_paths() {
        let mut config = HostConfig::default();
        config.apply_env(|key| match key {
            DATA_DIR_ENV => Some("/tmp/ph".into()),
            PLUGINS_DIR_ENV => Some("/opt/plugins".into()),
            _ => None,
        });
        assert_eq!(config.paths.data_dir, PathBuf::from("/tmp/ph"));
        assert_eq!(config.paths.plugins_dir(), PathBuf::from("/opt/plugins"));
        assert_eq!(
            config.paths.registry_file(),
            PathBuf::from("/tmp/ph/registry.json")
        );
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = HostConfig::default();
        config.apply_env(|_| Some(OsString::new()));
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HostConfig::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("plughost.toml");
        std::fs::write(&path, "[loader]\ninstall_dependencies = false\n").unwrap();
        let config = HostConfig::from_file(&path).unwrap();
        assert!(!config.loader_config().install_dependencies);
    }
}
