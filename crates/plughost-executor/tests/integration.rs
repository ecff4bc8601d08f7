//! Integration tests for the plughost-executor crate.
//!
//! Every test drives the real `echo-plugin` binary built from this crate,
//! installed through the loader into a temporary plugins directory.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use plughost_executor::{
    ChainStep, ExecutionContext, Executor, ExecutorConfig, PluginState, SELF_TEST_TEXT,
};
use plughost_loader::{Loader, LoaderConfig};
use plughost_registry::{PluginManifest, Registry};
use plughost_sandbox::{Sandbox, SandboxConfig};
use serde_json::{Value, json};

const ECHO_BIN: &str = env!("CARGO_BIN_EXE_echo-plugin");

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    loader: Loader,
    executor: Executor,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    fn with_config(config: ExecutorConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let registry = Registry::open(root.join("data").join("registry.json")).unwrap();
        let loader = Loader::new(
            registry.clone(),
            LoaderConfig::new(root.join("plugins")).with_install_dependencies(false),
        );
        let sandbox = Arc::new(Sandbox::new(
            SandboxConfig::default()
                .with_base_dir(root.join("sandbox"))
                .with_kill_grace(Duration::from_millis(200)),
        ));
        let executor = Executor::new(
            registry,
            sandbox,
            config.with_shutdown_grace(Duration::from_millis(500)),
        );
        Self {
            _dir: dir,
            root,
            loader,
            executor,
        }
    }

    fn registry(&self) -> &Registry {
        self.executor.registry()
    }

    /// Install the echo plugin under `id`, launched directly.
    async fn install_echo(&self, id: &str) {
        let dir = self.root.join("src").join(id);
        write_manifest(&dir, id, "echo-plugin");
        std::os::unix::fs::symlink(ECHO_BIN, dir.join("echo-plugin")).unwrap();
        self.loader.install_from_local(&dir, false).await.unwrap();
    }

    /// Install the echo plugin under `id` behind a shell wrapper that sets
    /// `env` first.
    async fn install_wrapped_echo(&self, id: &str, env: &[(&str, &str)]) {
        let dir = self.root.join("src").join(id);
        write_manifest(&dir, id, "main.sh");
        let exports: String = env
            .iter()
            .map(|(k, v)| format!("export {k}='{v}'\n"))
            .collect();
        std::fs::write(
            dir.join("main.sh"),
            format!("{exports}exec '{ECHO_BIN}'\n"),
        )
        .unwrap();
        self.loader.install_from_local(&dir, false).await.unwrap();
    }

    /// Install the echo plugin under `id` behind a wrapper that first forks
    /// a long-lived helper and records its pid in `pid_file`.
    async fn install_forking_echo(&self, id: &str, pid_file: &Path) {
        let dir = self.root.join("src").join(id);
        write_manifest(&dir, id, "main.sh");
        std::fs::write(
            dir.join("main.sh"),
            format!(
                "sleep 30 &\necho $! > '{}'\nexec '{ECHO_BIN}'\n",
                pid_file.display()
            ),
        )
        .unwrap();
        self.loader.install_from_local(&dir, false).await.unwrap();
    }

    async fn run(&self, id: &str, procedure: &str, input: Value) -> plughost_executor::ExecutionResult {
        self.executor
            .execute(id, procedure, input, &ExecutionContext::new("tester", "s-1"))
            .await
    }
}

fn echo_manifest(id: &str, main: &str) -> Value {
    json!({
        "id": id,
        "name": "Echo",
        "version": "1.0.0",
        "author": "tests",
        "description": "Echoes its input",
        "category": "utility",
        "capabilities": ["echo", "text"],
        "entry_points": {"main": main},
        "dependencies": {},
        "procedures": [
            {"id": "echo.run", "name": "Run"},
            {"id": "echo.upper", "name": "Upper"},
            {"id": "echo.fail", "name": "Fail"},
            {"id": "echo.sleep", "name": "Sleep"},
            {"id": "echo.crash", "name": "Crash"}
        ]
    })
}

fn write_manifest(dir: &Path, id: &str, main: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("plugin.json"),
        echo_manifest(id, main).to_string(),
    )
    .unwrap();
}

fn pid_of(result: &plughost_executor::ExecutionResult) -> u64 {
    result.metadata["pid"].as_u64().unwrap()
}

#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let state = stat.rsplit(')').next()?.split_whitespace().next()?.to_owned();
            Some(state != "Z")
        })
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..150 {
        if !process_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A timed-out call must take the plugin's forked helpers down with it.
#[cfg(target_os = "linux")]
async fn timeout_kills_forked_helper(config: ExecutorConfig) {
    let h = Harness::with_config(config.with_call_timeout(Duration::from_millis(300)));
    let pid_file = h.root.join("helper.pid");
    h.install_forking_echo("forker", &pid_file).await;

    let warm = h.run("forker", "echo.run", json!({})).await;
    assert!(warm.success, "{:?}", warm.error);
    let helper: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(process_running(helper));

    let result = h.run("forker", "echo.sleep", json!({"ms": 10_000})).await;
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(h.executor.state("forker"), PluginState::Unloaded);
    assert!(wait_until_gone(helper).await, "helper {helper} outlived the plugin");
}

// ═══════════════════════════════════════════════════════════════════════
//  Execute
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn echo_round_trip_records_usage() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let result = h.run("echo", "echo.run", json!({"text": "hello"})).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, json!({"text": "hello"}));
    assert!(result.error.is_none());
    assert_eq!(result.metadata["plugin_id"], json!("echo"));
    assert_eq!(result.performance_metrics.plugin_id, "echo");
    assert_eq!(result.performance_metrics.procedure_id, "echo.run");

    let entry = h.registry().get("echo").unwrap();
    assert_eq!(entry.usage_count, 1);
    assert!(entry.performance_metrics.last_used.is_some());

    assert_eq!(h.executor.state("echo"), PluginState::Initialized);
    assert_eq!(h.executor.loaded(), vec!["echo".to_owned()]);
    assert_eq!(h.executor.cleanup_all().await, 1);
}

#[tokio::test]
async fn instance_is_reused_between_calls() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let first = h.run("echo", "echo.run", json!({})).await;
    let second = h.run("echo", "echo.run", json!({})).await;
    assert_eq!(pid_of(&first), pid_of(&second));
    assert_eq!(second.metadata["calls"], json!(2));
    assert_eq!(h.executor.sandbox().sessions().len(), 1);

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn raw_reply_becomes_data() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let result = h.run("echo", "echo.upper", json!({"text": "quiet"})).await;
    assert!(result.success);
    assert_eq!(result.data, json!("QUIET"));

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn unknown_plugin_fails_fast() {
    let h = Harness::new();

    let result = h.run("ghost", "ghost.run", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
    assert_eq!(h.executor.state("ghost"), PluginState::Unloaded);
    assert!(h.registry().get("ghost").is_none());
}

#[tokio::test]
async fn inactive_plugin_is_not_executed() {
    let h = Harness::new();
    h.install_echo("echo").await;
    h.registry().set_active("echo", false).unwrap();

    let result = h.run("echo", "echo.run", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
    assert!(h.executor.loaded().is_empty());
    assert!(h.executor.sandbox().sessions().is_empty());
}

#[tokio::test]
async fn undeclared_procedure_is_rejected_before_loading() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let result = h.run("echo", "echo.nope", json!({})).await;
    assert!(!result.success);
    assert!(
        result
            .error
            .unwrap()
            .contains("procedure `echo.nope` not found")
    );
    assert!(h.executor.loaded().is_empty());
    // Failed calls still count.
    assert_eq!(h.registry().get("echo").unwrap().usage_count, 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures and eviction
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn plugin_error_keeps_instance() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let before = h.run("echo", "echo.run", json!({})).await;
    let failed = h.run("echo", "echo.fail", json!({"message": "bad input"})).await;
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("bad input"));
    assert_eq!(h.executor.state("echo"), PluginState::Initialized);

    let after = h.run("echo", "echo.run", json!({})).await;
    assert!(after.success);
    assert_eq!(pid_of(&before), pid_of(&after));

    let entry = h.registry().get("echo").unwrap();
    assert_eq!(entry.usage_count, 3);
    assert!(entry.performance_metrics.success_rate < 1.0);

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn dead_process_is_evicted_and_reloaded() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let before = h.run("echo", "echo.run", json!({})).await;
    let crashed = h.run("echo", "echo.crash", json!({})).await;
    assert!(!crashed.success);
    assert_eq!(h.executor.state("echo"), PluginState::Unloaded);
    assert!(h.executor.loaded().is_empty());
    assert!(h.executor.sandbox().sessions().is_empty());

    let after = h.run("echo", "echo.run", json!({})).await;
    assert!(after.success, "{:?}", after.error);
    assert_ne!(pid_of(&before), pid_of(&after));
    assert_eq!(after.metadata["calls"], json!(1));

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn slow_call_times_out_and_evicts() {
    let h = Harness::with_config(ExecutorConfig::default().with_call_timeout(Duration::from_millis(300)));
    h.install_echo("echo").await;

    let result = h.run("echo", "echo.sleep", json!({"ms": 10_000})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("timed out"));
    assert_eq!(h.executor.state("echo"), PluginState::Unloaded);
    assert!(result.performance_metrics.duration_ms < 5_000);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn sandboxed_timeout_kills_process_tree() {
    timeout_kills_forked_helper(ExecutorConfig::default()).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn unsandboxed_timeout_kills_process_tree() {
    timeout_kills_forked_helper(ExecutorConfig::default().with_sandboxed(false)).await;
}

#[tokio::test]
async fn missing_entry_point_fails_load() {
    let h = Harness::new();
    let dir = h.root.join("broken");
    std::fs::create_dir_all(&dir).unwrap();
    let manifest: PluginManifest =
        serde_json::from_value(echo_manifest("broken", "gone.py")).unwrap();
    h.registry()
        .register(manifest, "local:broken", dir)
        .unwrap();

    let result = h.run("broken", "echo.run", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("failed to load plugin `broken`"));
    assert_eq!(h.executor.state("broken"), PluginState::Unloaded);

    let entry = h.registry().get("broken").unwrap();
    assert_eq!(entry.usage_count, 1);
    assert!(entry.performance_metrics.success_rate < 1.0);
}

#[tokio::test]
async fn failed_initialize_fails_load() {
    let h = Harness::new();
    h.install_wrapped_echo("picky", &[("ECHO_PLUGIN_FAIL_INIT", "1")]).await;

    let result = h.run("picky", "echo.run", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("initialization refused"));
    assert!(h.executor.loaded().is_empty());
    assert!(h.executor.sandbox().sessions().is_empty());
}

#[tokio::test]
async fn plugin_without_capability_surface_fails_load() {
    let h = Harness::new();
    h.install_wrapped_echo("mute", &[("ECHO_PLUGIN_METHODS", "cleanup")]).await;

    let result = h.run("mute", "echo.run", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("advertises neither"));
    assert_eq!(h.executor.state("mute"), PluginState::Unloaded);
}

#[tokio::test]
async fn procedure_methods_are_called_directly() {
    let h = Harness::new();
    h.install_wrapped_echo("direct", &[("ECHO_PLUGIN_METHODS", "echo.run,echo.upper")])
        .await;

    let result = h.run("direct", "echo.upper", json!({"text": "abc"})).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, json!("ABC"));

    // Declared in the manifest but not advertised by the process.
    let result = h.run("direct", "echo.fail", json!({})).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
    assert_eq!(h.executor.state("direct"), PluginState::Initialized);

    h.executor.cleanup_all().await;
}

// ═══════════════════════════════════════════════════════════════════════
//  Chains
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn chain_threads_output_into_next_step() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let steps = [
        ChainStep::new("echo", "echo.run").with_params(json!({"lang": "fr"})),
        ChainStep::new("echo", "echo.run").with_params(json!({"text": "bonjour"})),
        ChainStep::new("echo", "echo.upper"),
    ];
    let result = h
        .executor
        .execute_chain(&steps, json!({"text": "hello"}), &ExecutionContext::default())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, json!("BONJOUR"));
    assert_eq!(result.metadata["step_count"], json!(3));
    let trace = result.metadata["steps"].as_array().unwrap();
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[0]["metadata"]["plugin_id"], json!("echo"));
    assert_eq!(trace[1]["metadata"]["calls"], json!(2));
    assert_eq!(h.registry().get("echo").unwrap().usage_count, 3);

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn chain_stops_at_failing_step() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let steps = [
        ChainStep::new("echo", "echo.run"),
        ChainStep::new("echo", "echo.fail").with_params(json!({"message": "stop here"})),
        ChainStep::new("echo", "echo.upper"),
    ];
    let result = h
        .executor
        .execute_chain(&steps, json!({"text": "hi"}), &ExecutionContext::default())
        .await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(
        error.starts_with("chain failed at step 2 (echo/echo.fail)"),
        "{error}"
    );
    assert!(error.contains("stop here"));
    assert_eq!(result.metadata["failed_step"], json!(2));
    assert_eq!(result.metadata["steps"].as_array().unwrap().len(), 2);
    // Step 3 never ran.
    assert_eq!(h.registry().get("echo").unwrap().usage_count, 2);

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn empty_chain_fails() {
    let h = Harness::new();
    let result = h
        .executor
        .execute_chain(&[], json!({}), &ExecutionContext::default())
        .await;
    assert!(!result.success);
    assert!(result.error.is_some());
}

// ═══════════════════════════════════════════════════════════════════════
//  Self-test
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn self_test_runs_first_procedure() {
    let h = Harness::new();
    h.install_echo("echo").await;

    let result = h.executor.test("echo").await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.performance_metrics.procedure_id, "echo.run");
    assert_eq!(result.data, json!({"test": true, "text": SELF_TEST_TEXT}));

    h.executor.cleanup_all().await;
}

#[tokio::test]
async fn self_test_needs_a_procedure() {
    let h = Harness::new();
    let mut manifest = echo_manifest("bare", "echo-plugin");
    manifest["procedures"] = json!([]);
    let manifest: PluginManifest = serde_json::from_value(manifest).unwrap();
    h.registry()
        .register(manifest, "local:bare", h.root.clone())
        .unwrap();

    let result = h.executor.test("bare").await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("declares no procedures"));

    let missing = h.executor.test("ghost").await;
    assert!(missing.error.unwrap().contains("not found"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Teardown and modes
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cleanup_unloads_and_releases_session() {
    let h = Harness::new();
    h.install_echo("echo").await;
    assert!(h.run("echo", "echo.run", json!({})).await.success);

    let session = h.executor.sandbox().sessions().pop().unwrap();
    assert_eq!(session.owner_id, "echo");
    assert!(session.root.exists());

    assert!(h.executor.cleanup("echo").await);
    assert_eq!(h.executor.state("echo"), PluginState::Unloaded);
    assert!(h.executor.sandbox().sessions().is_empty());
    assert!(!session.root.exists());

    assert!(!h.executor.cleanup("echo").await);
    assert!(!h.executor.cleanup("ghost").await);
}

#[tokio::test]
async fn unsandboxed_mode_runs_without_session() {
    let h = Harness::with_config(ExecutorConfig::default().with_sandboxed(false));
    h.install_echo("echo").await;

    let result = h.run("echo", "echo.run", json!({"n": 1})).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.data, json!({"n": 1}));
    assert!(h.executor.sandbox().sessions().is_empty());

    assert!(h.executor.cleanup("echo").await);
}
