//! Plugin installation.
//!
//! [`Loader`] turns a source (git URL or local directory) into a registered
//! plugin.  Git sources are cloned into a staging directory inside the
//! plugins root, validated there, and only then moved to
//! `<plugins_dir>/<id>` and registered.  Any failure drops the staging
//! directory and leaves the registry untouched.

use std::path::{Path, PathBuf};

use plughost_registry::{LOCAL_SOURCE_PREFIX, PluginEntry, Registry, RegistryError};
use tempfile::TempDir;

use crate::config::LoaderConfig;
use crate::deps;
use crate::error::{LoaderError, Result};
use crate::git;
use crate::manifest::read_manifest;
use crate::validate::validate_install;

const STAGING_PREFIX: &str = ".staging-";
const BACKUP_PREFIX: &str = ".previous-";

/// Fetches, validates and registers plugins.
#[derive(Debug, Clone)]
pub struct Loader {
    registry: Registry,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(registry: Registry, config: LoaderConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.config.plugins_dir
    }

    // -----------------------------------------------------------------------
    // Install
    // -----------------------------------------------------------------------

    /// Clone `url` at `git_ref` (default: the configured ref) and install it.
    ///
    /// Refuses to replace an already registered id unless `force` is set.
    pub async fn install_from_git(
        &self,
        url: &str,
        git_ref: Option<&str>,
        force: bool,
    ) -> Result<PluginEntry> {
        git::validate_url(url)?;
        let git_ref = git_ref.unwrap_or(&self.config.default_ref);
        git::validate_git_ref(git_ref)?;

        std::fs::create_dir_all(&self.config.plugins_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.config.plugins_dir)?;
        let checkout = staging.path().join("repo");

        git::clone(url, git_ref, &checkout, self.config.clone_timeout).await?;

        let manifest = read_manifest(&checkout)?;
        validate_install(&manifest, &checkout)?;
        self.ensure_installable(&manifest.id, force)?;

        let target = self.config.plugins_dir.join(&manifest.id);
        let backup = self.move_aside(&target)?;

        std::fs::rename(&checkout, &target).map_err(|e| {
            self.restore(&target, backup.as_ref());
            LoaderError::Install(format!(
                "failed to move checkout into `{}`: {e}",
                target.display()
            ))
        })?;

        self.install_dependencies(&manifest.id, &target).await;

        match self.registry.register(manifest.clone(), url, &target) {
            Ok(entry) => {
                tracing::info!(
                    plugin_id = %manifest.id,
                    version = %manifest.version,
                    source = %url,
                    git_ref = %git_ref,
                    "plugin installed from git"
                );
                Ok(entry)
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_dir_all(&target) {
                    tracing::warn!(path = %target.display(), error = %rm, "failed to remove unregistered install");
                }
                self.restore(&target, backup.as_ref());
                Err(e.into())
            }
        }
    }

    /// Validate and register a plugin directory in place.
    pub async fn install_from_local(&self, path: &Path, force: bool) -> Result<PluginEntry> {
        let root = path.canonicalize().map_err(|e| {
            LoaderError::manifest(path, format!("plugin directory not accessible: {e}"))
        })?;
        if !root.is_dir() {
            return Err(LoaderError::manifest(&root, "not a directory"));
        }

        let manifest = read_manifest(&root)?;
        validate_install(&manifest, &root)?;
        self.ensure_installable(&manifest.id, force)?;

        self.install_dependencies(&manifest.id, &root).await;

        let source = format!("{LOCAL_SOURCE_PREFIX}{}", root.display());
        let entry = self.registry.register(manifest, source, &root)?;

        tracing::info!(
            plugin_id = %entry.manifest.id,
            version = %entry.manifest.version,
            path = %root.display(),
            "plugin installed from local directory"
        );
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Update / uninstall
    // -----------------------------------------------------------------------

    /// Refresh an installed plugin.
    ///
    /// Git sources are pulled (fast-forward only); local sources are simply
    /// re-read.  The entry is re-registered only when the pull and the new
    /// manifest both check out, which resets its usage statistics.  A
    /// manifest that changes its own id is rejected.
    pub async fn update(&self, id: &str) -> Result<PluginEntry> {
        let current = self
            .registry
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        let root = current.local_path.clone();

        if !current.is_local() {
            git::pull(&root, self.config.clone_timeout).await?;
        }

        let manifest = read_manifest(&root)?;
        if manifest.id != id {
            return Err(LoaderError::validation(
                id,
                format!("manifest id changed to `{}`", manifest.id),
            ));
        }
        validate_install(&manifest, &root)?;

        self.install_dependencies(id, &root).await;

        let previous_version = current.manifest.version.clone();
        let entry = self
            .registry
            .register(manifest, current.source.clone(), root)?;

        tracing::info!(
            plugin_id = %id,
            from = %previous_version,
            to = %entry.manifest.version,
            "plugin updated"
        );
        Ok(entry)
    }

    /// Unregister a plugin.  With `delete_files`, also remove its install
    /// directory when it lives under the plugins root (local installs are
    /// never deleted).  Returns `false` if the id was not registered.
    pub async fn uninstall(&self, id: &str, delete_files: bool) -> Result<bool> {
        let Some(entry) = self.registry.get(id) else {
            return Ok(false);
        };

        self.registry.unregister(id)?;

        if delete_files && !entry.is_local() && self.is_managed(&entry.local_path) {
            tokio::fs::remove_dir_all(&entry.local_path).await?;
            tracing::info!(plugin_id = %id, path = %entry.local_path.display(), "plugin files removed");
        }

        tracing::info!(plugin_id = %id, "plugin uninstalled");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_installable(&self, id: &str, force: bool) -> Result<()> {
        if !force && self.registry.contains(id) {
            return Err(LoaderError::AlreadyInstalled { id: id.to_owned() });
        }
        Ok(())
    }

    async fn install_dependencies(&self, id: &str, root: &Path) {
        if !self.config.install_dependencies {
            return;
        }
        let report = deps::install(id, root, self.config.dependency_timeout).await;
        if !report.is_clean() {
            tracing::warn!(
                plugin_id = %id,
                failed = report.failed.len(),
                "plugin registered with unresolved dependencies"
            );
        }
    }

    /// Whether `path` is inside the plugins root.
    fn is_managed(&self, path: &Path) -> bool {
        match (path.canonicalize(), self.config.plugins_dir.canonicalize()) {
            (Ok(path), Ok(root)) => path.starts_with(&root) && path != root,
            _ => false,
        }
    }

    /// Move an existing install out of the way so it can be restored if the
    /// new one fails.  The returned directory is deleted on drop.
    fn move_aside(&self, target: &Path) -> Result<Option<TempDir>> {
        if !target.exists() {
            return Ok(None);
        }
        let backup = tempfile::Builder::new()
            .prefix(BACKUP_PREFIX)
            .tempdir_in(&self.config.plugins_dir)?;
        std::fs::rename(target, backup.path().join("plugin"))?;
        Ok(Some(backup))
    }

    fn restore(&self, target: &Path, backup: Option<&TempDir>) {
        let Some(backup) = backup else { return };
        let saved: PathBuf = backup.path().join("plugin");
        if let Err(e) = std::fs::rename(&saved, target) {
            tracing::warn!(path = %target.display(), error = %e, "failed to restore previous install");
        }
    }
}
