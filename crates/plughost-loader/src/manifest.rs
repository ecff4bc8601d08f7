//! Locating and parsing plugin manifests.
//!
//! A plugin repository carries its manifest at the root, either as
//! `plugin.json` or `plugin.toml` (checked in that order).  Parsing enforces
//! the required keys; [`check_manifest`] enforces the rules serde cannot
//! express (id charset, semver, a `main` entry point).

use std::path::{Path, PathBuf};

use plughost_registry::{MAIN_ENTRY_POINT, PluginManifest};

use crate::error::{LoaderError, Result};

/// Accepted manifest file names, in lookup order.
pub const MANIFEST_FILES: [&str; 2] = ["plugin.json", "plugin.toml"];

const MAX_ID_LEN: usize = 128;

/// Path of the first manifest file present in `dir`.
pub fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Read, parse and check the manifest at the root of `dir`.
pub fn read_manifest(dir: &Path) -> Result<PluginManifest> {
    let path = find_manifest(dir).ok_or_else(|| {
        LoaderError::manifest(
            dir,
            format!("no manifest found (expected one of {})", MANIFEST_FILES.join(", ")),
        )
    })?;

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| LoaderError::manifest(&path, format!("unreadable: {e}")))?;

    let manifest = parse_manifest(&path, &raw)?;
    check_manifest(&manifest).map_err(|reason| LoaderError::manifest(&path, reason))?;

    tracing::debug!(
        plugin_id = %manifest.id,
        version = %manifest.version,
        path = %path.display(),
        "manifest parsed"
    );
    Ok(manifest)
}

/// Parse manifest text; the format follows the file extension.
pub fn parse_manifest(path: &Path, raw: &str) -> Result<PluginManifest> {
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(raw).map_err(|e| LoaderError::manifest(path, e.to_string()))
    } else {
        serde_json::from_str(raw).map_err(|e| LoaderError::manifest(path, e.to_string()))
    }
}

/// Semantic checks on a parsed manifest.  Returns a human-readable reason on
/// failure.
pub fn check_manifest(manifest: &PluginManifest) -> std::result::Result<(), String> {
    check_id(&manifest.id)?;

    semver::Version::parse(manifest.version.trim())
        .map_err(|e| format!("version `{}` is not valid semver: {e}", manifest.version))?;

    if !manifest.entry_points.contains_key(MAIN_ENTRY_POINT) {
        return Err(format!("entry_points must declare `{MAIN_ENTRY_POINT}`"));
    }

    let mut seen = std::collections::BTreeSet::new();
    for procedure in &manifest.procedures {
        if procedure.id.trim().is_empty() {
            return Err("procedure ids must not be empty".into());
        }
        if !seen.insert(procedure.id.as_str()) {
            return Err(format!("duplicate procedure id `{}`", procedure.id));
        }
    }

    Ok(())
}

/// Plugin ids double as directory names, so they are restricted to a safe
/// charset.
fn check_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(format!("id must be 1-{MAX_ID_LEN} characters"));
    }
    let valid = id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !valid || id.starts_with('.') || id.starts_with('-') {
        return Err(format!(
            "id `{id}` may only contain letters, digits, '-', '_' and '.', and must not start with '.' or '-'"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_JSON: &str = r#"{
        "id": "echo",
        "name": "Echo",
        "version": "1.2.3",
        "author": "someone",
        "description": "echoes",
        "category": "utility",
        "capabilities": ["echo"],
        "entry_points": {"main": "main.py"},
        "dependencies": {},
        "procedures": [{"id": "echo.run", "name": "Run"}]
    }"#;

    fn parse(raw: &str) -> Result<PluginManifest> {
        parse_manifest(Path::new("plugin.json"), raw)
    }

    #[test]
    fn parses_valid_json() {
        let manifest = parse(VALID_JSON).unwrap();
        assert_eq!(manifest.id, "echo");
        assert!(check_manifest(&manifest).is_ok());
    }

    #[test]
    fn missing_required_key_is_manifest_error() {
        let raw = VALID_JSON.replace(r#""author": "someone","#, "");
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, LoaderError::Manifest { .. }));
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn parses_toml() {
        let raw = r#"
            id = "echo"
            name = "Echo"
            version = "0.1.0"
            author = "someone"
            description = "echoes"
            category = "utility"
            capabilities = ["echo"]

            [entry_points]
            main = "main.sh"

            [dependencies]

            [[procedures]]
            id = "echo.run"
            name = "Run"
        "#;
        let manifest = parse_manifest(Path::new("plugin.toml"), raw).unwrap();
        assert_eq!(manifest.main_entry(), Some("main.sh"));
        assert_eq!(manifest.procedures.len(), 1);
    }

    #[test]
    fn rejects_bad_semver() {
        let mut manifest = parse(VALID_JSON).unwrap();
        manifest.version = "one".into();
        assert!(check_manifest(&manifest).unwrap_err().contains("semver"));
    }

    #[test]
    fn rejects_missing_main() {
        let mut manifest = parse(VALID_JSON).unwrap();
        manifest.entry_points.clear();
        assert!(check_manifest(&manifest).unwrap_err().contains("main"));
    }

    #[test]
    fn rejects_unsafe_ids() {
        for id in ["", "../evil", "a/b", ".hidden", "-flag", "sp ace"] {
            let mut manifest = parse(VALID_JSON).unwrap();
            manifest.id = id.into();
            assert!(check_manifest(&manifest).is_err(), "{id:?} accepted");
        }
    }

    #[test]
    fn rejects_duplicate_procedures() {
        let mut manifest = parse(VALID_JSON).unwrap();
        let dup = manifest.procedures[0].clone();
        manifest.procedures.push(dup);
        assert!(check_manifest(&manifest).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn json_wins_over_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugin.toml"), "").unwrap();
        std::fs::write(dir.path().join("plugin.json"), VALID_JSON).unwrap();
        assert_eq!(
            find_manifest(dir.path()).unwrap(),
            dir.path().join("plugin.json")
        );
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_manifest(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no manifest found"));
    }
}
