//! Best-effort dependency installation.
//!
//! The plugin's own package manager is invoked for each declaration file
//! found at the install root.  Nothing here is fatal: a missing tool or a
//! failed install is logged and reported, and the plugin is still
//! registered.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

/// One package-manager invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStep {
    /// Declaration file that triggered the step.
    pub manifest_file: &'static str,
    pub program: &'static str,
    pub args: Vec<&'static str>,
}

/// What happened during dependency installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub installed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DependencyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Steps applicable to the plugin at `root`.
pub fn plan(root: &Path) -> Vec<DependencyStep> {
    let mut steps = Vec::new();
    if root.join("requirements.txt").is_file() {
        steps.push(DependencyStep {
            manifest_file: "requirements.txt",
            program: "python3",
            args: vec!["-m", "pip", "install", "--quiet", "-r", "requirements.txt"],
        });
    }
    if root.join("package.json").is_file() {
        steps.push(DependencyStep {
            manifest_file: "package.json",
            program: "npm",
            args: vec!["install", "--omit=dev", "--no-audit", "--no-fund"],
        });
    }
    steps
}

/// Run every planned step in `root`, each bounded by `timeout`.
pub async fn install(plugin_id: &str, root: &Path, timeout: Duration) -> DependencyReport {
    let mut report = DependencyReport::default();

    for step in plan(root) {
        tracing::info!(
            plugin_id = %plugin_id,
            file = step.manifest_file,
            program = step.program,
            "installing plugin dependencies"
        );

        let mut cmd = Command::new(step.program);
        cmd.args(&step.args)
            .current_dir(root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let failure = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => Some(format!("timed out after {}s", timeout.as_secs())),
            Ok(Err(e)) => Some(format!("failed to run {}: {e}", step.program)),
            Ok(Ok(output)) if !output.status.success() => Some(
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("non-zero exit")
                    .to_owned(),
            ),
            Ok(Ok(_)) => None,
        };

        match failure {
            None => report.installed.push(step.manifest_file.to_owned()),
            Some(reason) => {
                tracing::warn!(
                    plugin_id = %plugin_id,
                    file = step.manifest_file,
                    reason = %reason,
                    "dependency installation failed, continuing"
                );
                report.failed.push((step.manifest_file.to_owned(), reason));
            }
        }
    }

    report
}
