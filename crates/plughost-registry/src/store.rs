//! On-disk catalog persistence.
//!
//! The catalog is a single JSON document mapping plugin id to a serialized
//! [`PluginEntry`].  It is rewritten wholesale on every mutation: the new
//! content goes to a temp file in the same directory, is fsynced, and is then
//! renamed over the old file so a crash mid-write leaves either the old or
//! the new catalog, never a torn one.
//!
//! Mutations from different host processes are serialized through an
//! advisory lock on a sibling `.lk` file.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::entry::PluginEntry;
use crate::error::{RegistryError, Result};

/// Location of a catalog document and its lock file.
#[derive(Debug, Clone)]
pub(crate) struct CatalogFile {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Held while a read-modify-write cycle is in progress.  Dropping releases
/// the lock.
pub(crate) struct CatalogLock {
    file: File,
    path: PathBuf,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release registry lock");
        }
    }
}

impl CatalogFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lk");
        Self { path, lock_path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed entry.
    ///
    /// A missing file is an empty catalog.  Entries that fail to decode, or
    /// whose key disagrees with `manifest.id`, are skipped with a warning.
    pub(crate) fn load(&self) -> Result<BTreeMap<String, PluginEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "registry file absent, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(RegistryError::io(&self.path, e)),
        };

        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)?;
        let mut entries = BTreeMap::new();

        for (key, value) in document {
            match serde_json::from_value::<PluginEntry>(value) {
                Ok(entry) if entry.manifest.id == key => {
                    entries.insert(key, entry);
                }
                Ok(entry) => {
                    tracing::warn!(
                        key = %key,
                        manifest_id = %entry.manifest.id,
                        "registry key does not match manifest id, skipping entry"
                    );
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "malformed registry entry, skipping");
                }
            }
        }

        tracing::debug!(path = %self.path.display(), count = entries.len(), "registry loaded");
        Ok(entries)
    }

    /// Atomically replace the catalog with `entries`.
    pub(crate) fn save(&self, entries: &BTreeMap<String, PluginEntry>) -> Result<()> {
        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;

        let content = serde_json::to_string_pretty(entries)?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| RegistryError::io(parent, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| RegistryError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| RegistryError::io(&self.path, e.error))?;

        tracing::debug!(path = %self.path.display(), count = entries.len(), "registry saved");
        Ok(())
    }

    /// Acquire the exclusive cross-process lock, blocking until available.
    pub(crate) fn lock(&self) -> Result<CatalogLock> {
        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| RegistryError::Lock {
                path: self.lock_path.clone(),
                reason: format!("failed to open lock file: {e}"),
            })?;

        FileExt::lock_exclusive(&file).map_err(|e| RegistryError::Lock {
            path: self.lock_path.clone(),
            reason: e.to_string(),
        })?;

        Ok(CatalogLock {
            file,
            path: self.lock_path.clone(),
        })
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}
