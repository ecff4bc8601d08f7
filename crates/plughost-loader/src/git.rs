//! Hardened git invocations.
//!
//! Plugin sources are untrusted, so every `git` child runs with a scrubbed
//! environment: only `PATH` and `HOME` survive, system and global git config
//! are ignored, and credential prompts fail fast instead of blocking.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{LoaderError, Result};

/// URL prefixes accepted as git sources.
pub const ALLOWED_URL_PREFIXES: [&str; 4] = ["https://", "ssh://", "git@", "file://"];

/// Reject anything that is not an allowed git URL.
pub fn validate_url(url: &str) -> Result<()> {
    let unsupported = |reason: &str| LoaderError::UnsupportedSource {
        source_str: url.to_owned(),
        reason: reason.to_owned(),
    };

    if url.bytes().any(|b| b.is_ascii_control() || b == b' ') {
        return Err(unsupported("contains whitespace or control characters"));
    }
    if !ALLOWED_URL_PREFIXES.iter().any(|p| url.starts_with(p)) {
        return Err(unsupported(
            "only https://, ssh://, git@ and file:// sources are allowed",
        ));
    }
    Ok(())
}

/// Reject refs git would misinterpret or that could smuggle options.
pub fn validate_git_ref(git_ref: &str) -> Result<()> {
    let invalid = |reason: String| LoaderError::UnsupportedSource {
        source_str: git_ref.to_owned(),
        reason,
    };

    if git_ref.is_empty() || git_ref.len() > 256 {
        return Err(invalid("git ref must be 1-256 characters".into()));
    }
    if git_ref.starts_with('-') {
        return Err(invalid("git ref must not start with '-'".into()));
    }
    let valid_chars = git_ref
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/'));
    if !valid_chars {
        return Err(invalid("git ref contains invalid characters".into()));
    }
    if git_ref.contains("..")
        || git_ref.contains("//")
        || git_ref.starts_with('.')
        || git_ref.ends_with('.')
        || git_ref.starts_with('/')
        || git_ref.ends_with('/')
        || git_ref.ends_with(".lock")
    {
        return Err(invalid(format!("git ref has invalid format: `{git_ref}`")));
    }
    Ok(())
}

fn git_command() -> Command {
    let mut cmd = Command::new("git");
    cmd.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    if let Ok(home) = std::env::var("HOME") {
        cmd.env("HOME", home);
    }
    cmd.env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_SSH_COMMAND", "ssh -o BatchMode=yes")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn run_git(mut cmd: Command, what: &str, timeout: Duration) -> Result<()> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            LoaderError::Install(format!("git {what} timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| LoaderError::Install(format!("failed to run git {what}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LoaderError::Install(format!(
            "git {what} failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Shallow-clone `git_ref` of `url` into `dest` (which must not exist or be
/// empty).
pub async fn clone(url: &str, git_ref: &str, dest: &Path, timeout: Duration) -> Result<()> {
    validate_url(url)?;
    validate_git_ref(git_ref)?;

    tracing::info!(url = %url, git_ref = %git_ref, dest = %dest.display(), "cloning plugin repository");

    let mut cmd = git_command();
    cmd.args(["clone", "--depth=1", "--single-branch", "--branch", git_ref, "--"])
        .arg(url)
        .arg(dest);
    run_git(cmd, "clone", timeout).await
}

/// Fast-forward the checkout at `dir` from its upstream.
pub async fn pull(dir: &Path, timeout: Duration) -> Result<()> {
    tracing::info!(dir = %dir.display(), "pulling plugin repository");

    let mut cmd = git_command();
    cmd.arg("-C").arg(dir).args(["pull", "--ff-only"]);
    run_git(cmd, "pull", timeout).await
}
