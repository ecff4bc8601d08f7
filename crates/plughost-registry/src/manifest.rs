//! Plugin manifest model.
//!
//! A [`PluginManifest`] is the declarative, author-supplied description of a
//! plugin: identity, capabilities, entry points, and the procedures it
//! exposes.  It is immutable per version.  Parsing from disk and validation
//! against an install directory live in the loader crate; this module only
//! defines the shape shared by every component.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Entry point every manifest must declare.
pub const MAIN_ENTRY_POINT: &str = "main";

/// Optional entry point for mobile execution.
pub const MOBILE_ENTRY_POINT: &str = "mobile";

/// Declarative plugin metadata shipped at the root of a plugin repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Globally unique plugin id (registry key).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version string.
    pub version: String,
    /// Author name or handle.
    pub author: String,
    /// Short description, included in search.
    pub description: String,
    /// Single category tag.
    pub category: String,
    /// Free-form capability tags.
    pub capabilities: BTreeSet<String>,
    /// Symbolic entry point name -> path relative to the install root.
    pub entry_points: BTreeMap<String, String>,
    /// Opaque dependency declaration handed to the runtime's package manager.
    pub dependencies: serde_json::Value,
    /// Optional mobile-specific settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<serde_json::Value>,
    /// Requested permissions.  Advisory only.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Procedures in declaration order.
    #[serde(default)]
    pub procedures: Vec<ProcedureDescriptor>,
}

/// A named operation a plugin exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    /// Dispatch id, e.g. `echo.run`.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginManifest {
    /// The relative path of the `main` entry point, if declared.
    pub fn main_entry(&self) -> Option<&str> {
        self.entry_points.get(MAIN_ENTRY_POINT).map(String::as_str)
    }

    /// The relative path of the `mobile` entry point, if declared.
    pub fn mobile_entry(&self) -> Option<&str> {
        self.entry_points.get(MOBILE_ENTRY_POINT).map(String::as_str)
    }

    /// Whether `procedure_id` is among the declared procedures.
    pub fn has_procedure(&self, procedure_id: &str) -> bool {
        self.procedures.iter().any(|p| p.id == procedure_id)
    }

    /// Declared procedure ids in declaration order.
    pub fn procedure_ids(&self) -> impl Iterator<Item = &str> {
        self.procedures.iter().map(|p| p.id.as_str())
    }

    /// Number of distinct capabilities.
    pub fn capability_count(&self) -> usize {
        self.capabilities.len()
    }
}
