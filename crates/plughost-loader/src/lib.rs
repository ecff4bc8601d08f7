//! Plugin loader for PlugHost.
//!
//! Fetches untrusted plugin code, checks it, and records it in the
//! [`plughost_registry::Registry`]:
//!
//! - **[`git`]** -- URL / ref allow-listing and hardened `git clone` /
//!   `git pull` with timeouts.
//! - **[`manifest`]** -- `plugin.json` / `plugin.toml` discovery and parsing.
//! - **[`validate`]** -- entry points must exist inside the install root.
//! - **[`deps`]** -- best-effort `pip` / `npm` installs; never fatal.
//! - **[`loader`]** -- [`Loader`]: `install_from_git`, `install_from_local`,
//!   `update`, `uninstall`.

pub mod config;
pub mod deps;
pub mod error;
pub mod git;
pub mod loader;
pub mod manifest;
pub mod validate;

pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use loader::Loader;
pub use manifest::{MANIFEST_FILES, read_manifest};
pub use validate::validate_install;
