//! Checking a manifest against the files of an install directory.

use std::path::{Component, Path};

use plughost_registry::PluginManifest;

use crate::error::{LoaderError, Result};

/// Every declared entry point (including `mobile`, when present) must be a
/// relative path that stays inside `root` and names an existing file.
pub fn validate_install(manifest: &PluginManifest, root: &Path) -> Result<()> {
    for (name, relative) in &manifest.entry_points {
        let path = Path::new(relative);

        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.trim().is_empty() || escapes {
            return Err(LoaderError::validation(
                &manifest.id,
                format!("entry point `{name}` -> `{relative}` must be a relative path inside the plugin"),
            ));
        }

        if !root.join(path).is_file() {
            return Err(LoaderError::validation(
                &manifest.id,
                format!(
                    "entry point `{name}` -> `{relative}` not found under `{}`",
                    root.display()
                ),
            ));
        }
    }

    tracing::debug!(
        plugin_id = %manifest.id,
        entry_points = manifest.entry_points.len(),
        "entry points validated"
    );
    Ok(())
}
