//! CLI argument definitions for PlugHost.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! wiring and `commands.rs` on behaviour.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// PlugHost -- install, manage and run sandboxed plugins.
#[derive(Parser)]
#[command(
    name = "plughost",
    version,
    about = "PlugHost -- install, manage and run sandboxed plugins",
    long_about = "Installs plugins from git repositories or local directories, keeps a \
                  persistent catalog of them, and runs their procedures as resource-limited \
                  child processes."
)]
pub struct Cli {
    /// Path to a TOML config file (default: ./plughost.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install a plugin from a git URL or a local directory.
    Install {
        /// Git URL (https://, ssh://, git@, file://) or directory path.
        source: String,

        /// Branch or tag to clone.
        #[arg(long)]
        version: Option<String>,

        /// Replace an existing installation with the same id.
        #[arg(long)]
        force: bool,

        /// Treat the source as a local directory and install in place.
        #[arg(long)]
        local: bool,
    },

    /// Pull the latest revision of an installed plugin and re-register it.
    Update {
        /// Plugin id.
        id: String,
    },

    /// List installed plugins.
    List,

    /// Show details of an installed plugin.
    Info {
        /// Plugin id.
        id: String,
    },

    /// Uninstall a plugin.
    Remove {
        /// Plugin id.
        id: String,

        /// Keep the install directory on disk.
        #[arg(long)]
        keep_files: bool,
    },

    /// Smoke-test a plugin by running its first procedure.
    Test {
        /// Plugin id.
        id: String,
    },

    /// Run one procedure of a plugin.
    Execute {
        /// Plugin id.
        id: String,

        /// Procedure id, e.g. `echo.run`.
        procedure: String,

        /// Input payload as JSON.
        #[arg(default_value = "{}")]
        input_json: String,
    },

    /// Search installed plugins by name, description or capability.
    Search {
        /// Search query.
        query: String,
    },

    /// Show the most used plugins.
    Trending {
        /// Maximum number of results.
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },

    /// Show collection statistics.
    Stats,
}
