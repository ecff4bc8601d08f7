//! Executor configuration.

use std::time::Duration;

use plughost_sandbox::ResourceLimits;

use crate::instance::DEFAULT_MAX_LINE_BYTES;

/// Configuration for [`Executor`](crate::Executor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Spawn plugin processes inside a sandbox session.
    pub sandboxed: bool,
    /// Limits for each plugin's session.  `None` uses the sandbox default.
    pub limits: Option<ResourceLimits>,
    /// Budget for process start plus the `initialize` exchange.
    pub init_timeout: Duration,
    /// Budget for a single procedure call.
    pub call_timeout: Duration,
    /// How long an unloading plugin gets to exit after stdin closes.
    pub shutdown_grace: Duration,
    /// Opaque host configuration handed to every plugin's `initialize`.
    pub plugin_config: serde_json::Value,
    /// Longest single response line accepted from a plugin.
    pub max_message_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sandboxed: true,
            limits: None,
            init_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
            plugin_config: serde_json::Value::Null,
            max_message_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ExecutorConfig {
    pub fn with_sandboxed(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_plugin_config(mut self, config: serde_json::Value) -> Self {
        self.plugin_config = config;
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }
}
