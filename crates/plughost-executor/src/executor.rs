//! Procedure dispatch over cached plugin processes.
//!
//! Each plugin id owns one slot holding at most one live
//! [`PluginInstance`].  The slot's async mutex serializes every call into
//! that plugin, including the lazy load on first use, so a plugin never
//! sees two requests at once and is never spawned twice.
//!
//! ```text
//! Unloaded -> Loading -> Initialized <-> Executing
//!     ^                      |               |
//!     +---- cleanup ---------+---- fatal ----+
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use plughost_registry::{PluginEntry, PluginManifest, Registry};
use plughost_sandbox::{CommandSpec, Sandbox};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::instance::PluginInstance;
use crate::interpreter;
use crate::protocol::PROCESS;
use crate::types::{ChainStep, ExecutionContext, ExecutionResult};

/// Payload sent by [`Executor::test`].
pub const SELF_TEST_TEXT: &str = "plughost self-test";

type Slot = Arc<Mutex<Option<PluginInstance>>>;

/// Lifecycle of one plugin id inside an [`Executor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Initialized,
    Executing,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Initialized => "initialized",
            Self::Executing => "executing",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loads plugins on demand and runs their procedures.
pub struct Executor {
    registry: Registry,
    sandbox: Arc<Sandbox>,
    config: ExecutorConfig,
    slots: DashMap<String, Slot>,
    states: DashMap<String, PluginState>,
}

impl Executor {
    pub fn new(registry: Registry, sandbox: Arc<Sandbox>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            sandbox,
            config,
            slots: DashMap::new(),
            states: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Current lifecycle state of `plugin_id`.
    pub fn state(&self, plugin_id: &str) -> PluginState {
        self.states
            .get(plugin_id)
            .map(|s| *s.value())
            .unwrap_or(PluginState::Unloaded)
    }

    /// Ids with a live plugin process, sorted.
    pub fn loaded(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|s| matches!(s.value(), PluginState::Initialized | PluginState::Executing))
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run one procedure.
    ///
    /// Never fails: every error becomes `success: false` with a message.
    /// The outcome is always recorded in the registry.
    pub async fn execute(
        &self,
        plugin_id: &str,
        procedure_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();

        let result = match self.dispatch(plugin_id, procedure_id, input, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    plugin_id = %plugin_id,
                    procedure_id = %procedure_id,
                    error = %e,
                    "plugin execution failed"
                );
                ExecutionResult::failure(e.to_string())
            }
        };

        let elapsed = started.elapsed();
        if let Err(e) = self
            .registry
            .record_execution(plugin_id, result.success, elapsed)
        {
            warn!(plugin_id = %plugin_id, error = %e, "failed to record plugin usage");
        }

        debug!(
            plugin_id = %plugin_id,
            procedure_id = %procedure_id,
            success = result.success,
            duration_ms = millis(elapsed),
            "procedure executed"
        );
        result.with_metrics(plugin_id, procedure_id, millis(elapsed))
    }

    /// Run `steps` in order, feeding each step's `data` to the next.
    ///
    /// Stops at the first failure and names it by 1-based position.
    pub async fn execute_chain(
        &self,
        steps: &[ChainStep],
        input: Value,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        let Some(last) = steps.last() else {
            return ExecutionResult::failure("execution chain is empty");
        };

        let mut payload = input;
        let mut trace = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let number = index + 1;
            let result = self
                .execute(
                    &step.plugin_id,
                    &step.procedure_id,
                    step.input_for(payload),
                    ctx,
                )
                .await;

            trace.push(json!({
                "step": number,
                "plugin_id": step.plugin_id,
                "procedure_id": step.procedure_id,
                "success": result.success,
                "duration_ms": result.performance_metrics.duration_ms,
                "metadata": result.metadata,
            }));

            if !result.success {
                let reason = result.error.unwrap_or_default();
                warn!(
                    step = number,
                    plugin_id = %step.plugin_id,
                    procedure_id = %step.procedure_id,
                    error = %reason,
                    "execution chain aborted"
                );
                return ExecutionResult::failure(format!(
                    "chain failed at step {number} ({}/{}): {reason}",
                    step.plugin_id, step.procedure_id
                ))
                .with_metadata("failed_step", json!(number))
                .with_metadata("steps", Value::Array(trace))
                .with_metrics(&step.plugin_id, &step.procedure_id, millis(started.elapsed()));
            }
            payload = result.data;
        }

        info!(steps = steps.len(), "execution chain completed");
        ExecutionResult::ok(payload)
            .with_metadata("step_count", json!(steps.len()))
            .with_metadata("steps", Value::Array(trace))
            .with_metrics(&last.plugin_id, &last.procedure_id, millis(started.elapsed()))
    }

    /// Smoke-test a plugin by running its first declared procedure with a
    /// canned payload.
    pub async fn test(&self, plugin_id: &str) -> ExecutionResult {
        let Some(entry) = self.registry.get(plugin_id) else {
            return ExecutionResult::failure(ExecutorError::NotFound(plugin_id.to_owned()).to_string());
        };
        let Some(procedure_id) = entry.manifest.procedure_ids().next().map(str::to_owned) else {
            return ExecutionResult::failure(format!(
                "plugin `{plugin_id}` declares no procedures to test"
            ));
        };

        let payload = json!({ "test": true, "text": SELF_TEST_TEXT });
        let ctx = ExecutionContext::new("plughost", "self-test");
        self.execute(plugin_id, &procedure_id, payload, &ctx).await
    }

    async fn dispatch(
        &self,
        plugin_id: &str,
        procedure_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let entry = self
            .registry
            .get(plugin_id)
            .ok_or_else(|| ExecutorError::NotFound(plugin_id.to_owned()))?;
        if !entry.is_active {
            return Err(ExecutorError::Inactive(plugin_id.to_owned()));
        }
        if !entry.manifest.has_procedure(procedure_id) {
            return Err(ExecutorError::ProcedureNotFound {
                plugin_id: plugin_id.to_owned(),
                procedure_id: procedure_id.to_owned(),
            });
        }

        let slot = self.slot(plugin_id);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            self.set_state(plugin_id, PluginState::Loading);
            match self.load(&entry).await {
                Ok(instance) => *guard = Some(instance),
                Err(e) => {
                    self.set_state(plugin_id, PluginState::Unloaded);
                    return Err(e);
                }
            }
        }
        let Some(instance) = guard.as_mut() else {
            return Err(ExecutorError::load(plugin_id, "plugin instance missing after load"));
        };

        self.set_state(plugin_id, PluginState::Executing);
        let outcome = self.invoke(instance, procedure_id, input, ctx).await;

        match outcome {
            Ok(reply) => {
                self.set_state(plugin_id, PluginState::Initialized);
                Ok(ExecutionResult::from_reply(reply))
            }
            Err(e) if e.is_fatal() => {
                warn!(plugin_id = %plugin_id, error = %e, "evicting plugin instance");
                if let Some(instance) = guard.take() {
                    self.discard(instance).await;
                }
                self.set_state(plugin_id, PluginState::Unloaded);
                Err(e)
            }
            Err(e) => {
                self.set_state(plugin_id, PluginState::Initialized);
                Err(e)
            }
        }
    }

    async fn invoke(
        &self,
        instance: &mut PluginInstance,
        procedure_id: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let plugin_id = instance.plugin_id().to_owned();
        let context = ctx.to_wire(&plugin_id, procedure_id);
        let timeout = self.config.call_timeout;

        if instance.supports(PROCESS) {
            let params = json!({ "procedure": procedure_id, "input": input, "context": context });
            instance.call(PROCESS, params, timeout).await
        } else if instance.supports(procedure_id) {
            let params = json!({ "input": input, "context": context });
            instance.call(procedure_id, params, timeout).await
        } else {
            Err(ExecutorError::ProcedureNotFound {
                plugin_id,
                procedure_id: procedure_id.to_owned(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    async fn load(&self, entry: &PluginEntry) -> Result<PluginInstance> {
        let plugin_id = entry.id();
        let main = entry
            .manifest
            .main_entry()
            .ok_or_else(|| ExecutorError::load(plugin_id, "manifest declares no `main` entry point"))?;
        let root = std::path::absolute(&entry.local_path)?;
        let path = root.join(main);
        if !path.is_file() {
            return Err(ExecutorError::load(
                plugin_id,
                format!("entry point `{}` not found", path.display()),
            ));
        }

        let command = interpreter::launch_command(&path)
            .current_dir(&root)
            .env("PLUGHOST_PLUGIN_ID", plugin_id)
            .env("PLUGHOST_PLUGIN_DIR", &root);

        let mut instance = self.spawn(plugin_id, &command).await?;

        let params = json!({ "plugin_id": plugin_id, "config": self.config.plugin_config });
        let ready = match instance.initialize(params, self.config.init_timeout).await {
            Ok(()) => check_surface(&instance, &entry.manifest),
            Err(e) => Err(e),
        };

        if let Err(e) = ready {
            self.discard(instance).await;
            return Err(match e {
                ExecutorError::Load { .. } => e,
                other => ExecutorError::load(plugin_id, other.to_string()),
            });
        }

        info!(
            plugin_id = %plugin_id,
            pid = ?instance.pid(),
            sandboxed = instance.session().is_some(),
            command = %command.display(),
            "plugin loaded"
        );
        Ok(instance)
    }

    async fn spawn(&self, plugin_id: &str, command: &CommandSpec) -> Result<PluginInstance> {
        if !self.config.sandboxed {
            let mut cmd = Command::new(command.program());
            cmd.args(command.get_args());
            if let Some(dir) = command.get_current_dir() {
                cmd.current_dir(dir);
            }
            for (key, value) in command.get_env() {
                cmd.env(key, value);
            }
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            #[cfg(unix)]
            cmd.process_group(0);

            let child = cmd.spawn().map_err(|e| {
                ExecutorError::load(plugin_id, format!("cannot start `{}`: {e}", command.display()))
            })?;
            return Ok(self.prepare(PluginInstance::attach(plugin_id, child, None)?));
        }

        let limits = self
            .config
            .limits
            .clone()
            .unwrap_or_else(|| self.sandbox.config().limits.clone());
        let session = self.sandbox.create_session_with_limits(plugin_id, limits)?;

        let child = match self.sandbox.spawn(&session, command) {
            Ok(child) => child,
            Err(e) => {
                self.sandbox.cleanup(&session).await;
                return Err(ExecutorError::load(plugin_id, e.to_string()));
            }
        };
        Ok(self.prepare(PluginInstance::attach(plugin_id, child, Some(session))?))
    }

    fn prepare(&self, instance: PluginInstance) -> PluginInstance {
        instance
            .with_process_group()
            .with_max_line_bytes(self.config.max_message_bytes)
    }

    /// Kill an instance and release its sandbox session.
    async fn discard(&self, instance: PluginInstance) {
        let session = instance.session();
        instance.kill().await;
        if let Some(session) = session {
            self.sandbox.cleanup(&session).await;
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Shut down `plugin_id`'s process.  Returns `false` if it was not
    /// loaded.
    pub async fn cleanup(&self, plugin_id: &str) -> bool {
        let Some(slot) = self.slots.get(plugin_id).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(instance) = guard.take() else {
            return false;
        };

        let session = instance.session();
        let status = instance.shutdown(self.config.shutdown_grace).await;
        if let Some(session) = session {
            self.sandbox.cleanup(&session).await;
        }
        self.set_state(plugin_id, PluginState::Unloaded);

        info!(plugin_id = %plugin_id, status = ?status, "plugin unloaded");
        true
    }

    /// Shut down every loaded plugin.  Returns how many were running.
    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        let results = futures::future::join_all(ids.iter().map(|id| self.cleanup(id))).await;
        results.into_iter().filter(|unloaded| *unloaded).count()
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    fn slot(&self, plugin_id: &str) -> Slot {
        Arc::clone(
            self.slots
                .entry(plugin_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        )
    }

    fn set_state(&self, plugin_id: &str, state: PluginState) {
        if state == PluginState::Unloaded {
            self.states.remove(plugin_id);
        } else {
            self.states.insert(plugin_id.to_owned(), state);
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("sandboxed", &self.config.sandboxed)
            .field("loaded", &self.loaded())
            .finish()
    }
}

/// A plugin must advertise `process` or at least one declared procedure.
fn check_surface(instance: &PluginInstance, manifest: &PluginManifest) -> Result<()> {
    if instance.supports(PROCESS) || manifest.procedure_ids().any(|p| instance.supports(p)) {
        return Ok(());
    }
    Err(ExecutorError::load(
        instance.plugin_id(),
        format!(
            "plugin advertises neither `{PROCESS}` nor any declared procedure (got {:?})",
            instance.methods()
        ),
    ))
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
