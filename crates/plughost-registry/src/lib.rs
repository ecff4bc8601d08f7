//! Persistent plugin catalog for PlugHost.
//!
//! This crate provides:
//!
//! - **Manifest model**: [`PluginManifest`] describes what a plugin is, what
//!   it can do, and how to start it.
//!
//! - **Registry**: [`Registry`] stores one [`PluginEntry`] per plugin id,
//!   maintains category and capability indexes, and ranks search results by
//!   a score derived from capabilities, usage and reliability.
//!
//! - **Persistence**: the catalog lives in a single JSON file that is
//!   replaced atomically on every mutation.  A sibling lock file serializes
//!   writers across host processes.
//!
//! Validation of manifests is the loader's concern; the registry stores what
//! it is given.

pub mod entry;
pub mod error;
pub mod manifest;
pub mod registry;
mod store;

pub use entry::{LOCAL_SOURCE_PREFIX, PerformanceMetrics, PluginEntry, Rarity};
pub use error::{RegistryError, Result};
pub use manifest::{MAIN_ENTRY_POINT, MOBILE_ENTRY_POINT, PluginManifest, ProcedureDescriptor};
pub use registry::{CollectionStats, Registry};
