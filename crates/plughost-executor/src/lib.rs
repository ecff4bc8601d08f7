//! PlugHost executor.
//!
//! Turns `(plugin_id, procedure_id, input)` into a call on a live plugin
//! process:
//!
//! - **[`executor`]** -- [`Executor`]: lazy loading, the per-plugin instance
//!   cache and state machine, `execute`, `execute_chain`, `test`, `cleanup`.
//! - **[`instance`]** -- [`PluginInstance`], one spawned process and its
//!   request/response channel.
//! - **[`protocol`]** -- the newline-delimited JSON wire format.
//! - **[`interpreter`]** -- picks `python3`, `bash`, `node` or `deno` from the
//!   entry point's extension.
//! - **[`guest`]** -- the plugin side of the protocol, for Rust plugins.
//!
//! Plugin processes run inside a [`plughost_sandbox::Sandbox`] session
//! unless [`ExecutorConfig::sandboxed`] is off.

pub mod config;
pub mod error;
pub mod executor;
pub mod guest;
pub mod instance;
pub mod interpreter;
pub mod protocol;
pub mod types;

pub use config::ExecutorConfig;
pub use error::{ExecutorError, Result};
pub use executor::{Executor, PluginState, SELF_TEST_TEXT};
pub use instance::PluginInstance;
pub use interpreter::Interpreter;
pub use types::{CallMetrics, ChainStep, ExecutionContext, ExecutionResult};
