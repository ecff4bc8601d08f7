//! The sandbox proper.
//!
//! [`Sandbox`] hands out sessions, launches commands inside them with limits
//! applied, watches their resource usage, and tears everything down again.
//!
//! Every child is started as the leader of its own process group so the
//! whole tree it forks can be signalled at once.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command::CommandSpec;
use crate::config::{ResourceLimits, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::limits::{LimitCheck, Metric, ResourceSnapshot};
use crate::monitor::{self, Monitor};
use crate::outcome::{FailureKind, RunOutcome, classify_exit};
use crate::platform::{self, Enforcement, ResourceLimiter};
use crate::session::{self, RetiredSessions, Session, SessionId, SessionInfo};

/// How many cleaned session ids are remembered for idempotent `cleanup`.
const RETIRED_CAPACITY: usize = 4096;

/// Name of the file that collects stderr of long-lived children.
const SPAWN_LOG_FILE: &str = "stderr.log";

enum Verdict {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Limit(Metric, String),
}

/// Resource-limited execution environment.
///
/// All methods take `&self`; share one instance behind an `Arc`.
pub struct Sandbox {
    config: SandboxConfig,
    limiter: Arc<dyn ResourceLimiter>,
    sessions: DashMap<SessionId, Session>,
    retired: RetiredSessions,
}

impl Sandbox {
    /// Create a sandbox using the platform's default limiter.
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_limiter(config, platform::default_limiter())
    }

    /// Create a sandbox with an explicit limiter backend.
    pub fn with_limiter(config: SandboxConfig, limiter: Arc<dyn ResourceLimiter>) -> Self {
        info!(
            base_dir = %config.base_dir.display(),
            limiter = limiter.name(),
            "sandbox initialised"
        );
        Self {
            config,
            limiter,
            sessions: DashMap::new(),
            retired: RetiredSessions::with_capacity(RETIRED_CAPACITY),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// What the active backend enforces for `limits`.
    pub fn enforcement(&self, limits: &ResourceLimits) -> Enforcement {
        self.limiter.enforcement(limits)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Allocate a session with the configured default limits.
    pub fn create_session(&self, owner_id: &str) -> Result<SessionId> {
        self.create_session_with_limits(owner_id, self.config.limits.clone())
    }

    /// Allocate a session with explicit limits.
    pub fn create_session_with_limits(
        &self,
        owner_id: &str,
        limits: ResourceLimits,
    ) -> Result<SessionId> {
        let mut session = Session::new(owner_id.to_owned(), PathBuf::new(), limits);
        session.root = self.config.base_dir.join(session.id.to_string());
        session::create_scratch_tree(&session.root)?;

        let id = session.id;
        info!(
            session = %id,
            owner = %owner_id,
            root = %session.root.display(),
            "sandbox session created"
        );
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Read-only view of a live session.
    pub fn session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.info())
    }

    /// Every live session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.info()).collect()
    }

    /// Root of the session's scratch tree.
    pub fn session_dir(&self, id: &SessionId) -> Option<PathBuf> {
        self.sessions.get(id).map(|s| s.root.clone())
    }

    fn parts(&self, id: &SessionId) -> Result<(PathBuf, ResourceLimits)> {
        self.sessions
            .get(id)
            .map(|s| (s.root.clone(), s.limits.clone()))
            .ok_or(SandboxError::SessionNotFound(*id))
    }

    fn track(&self, id: &SessionId, pid: u32) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.processes.insert(pid);
        }
    }

    fn untrack(&self, id: &SessionId, pid: u32) {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.processes.remove(&pid);
        }
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    fn build_command(
        &self,
        id: &SessionId,
        root: &Path,
        limits: &ResourceLimits,
        spec: &CommandSpec,
    ) -> Command {
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.get_args())
            .current_dir(spec.get_current_dir().unwrap_or(root))
            .env("PLUGHOST_SESSION_ID", id.to_string())
            .env("PLUGHOST_SESSION_DIR", root)
            .env("PLUGHOST_INPUT_DIR", root.join("input"))
            .env("PLUGHOST_OUTPUT_DIR", root.join("output"))
            .env("PLUGHOST_CACHE_DIR", root.join("cache"))
            .env("PLUGHOST_TEMP_DIR", root.join("temp"))
            .env("TMPDIR", root.join("temp"))
            .env(
                "PLUGHOST_ALLOW_NETWORK",
                if limits.allow_network { "1" } else { "0" },
            )
            .kill_on_drop(true);

        for (key, value) in spec.get_env() {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        self.limiter.apply(&mut cmd, limits);
        cmd
    }

    /// Run `command` to completion inside `session`.
    ///
    /// `input`, when given, is written to the child's stdin which is then
    /// closed.  The call never outlives `timeout` by more than the kill
    /// grace period.  Failures of the command itself (timeout, limit,
    /// non-zero exit) are reported in the outcome, not as `Err`.
    pub async fn run(
        &self,
        session: &SessionId,
        command: &CommandSpec,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        let (root, limits) = self.parts(session)?;
        let enforcement = self.limiter.enforcement(&limits);

        let mut cmd = self.build_command(session, &root, &limits, command);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        debug!(
            session = %session,
            command = %command.display(),
            timeout_ms = timeout.as_millis() as u64,
            "sandbox run starting"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.display(),
            source,
        })?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.track(session, pid);
        }

        if let (Some(mut stdin), Some(data)) = (child.stdin.take(), input) {
            let data = data.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }

        let cap = self.config.max_output_bytes;
        let stdout_task = tokio::spawn(drain(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(drain(child.stderr.take(), cap));

        let mut monitor = Monitor::new();
        let mut peak = ResourceSnapshot::default();
        let mut ticker = tokio::time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let verdict = loop {
            tokio::select! {
                status = child.wait() => break Verdict::Exited(status),
                () = &mut deadline => break Verdict::TimedOut,
                _ = ticker.tick() => {
                    let Some(pid) = pid else { continue };
                    let sample = monitor.sample(&[pid], &root);
                    peak.absorb(&sample);
                    let check = LimitCheck::evaluate(&sample, &limits);
                    if let Some((metric, reason)) = check.reasons(&limits).into_iter().next() {
                        break Verdict::Limit(metric, reason);
                    }
                }
            }
        };

        let (status, forced) = match verdict {
            Verdict::Exited(Ok(status)) => (Some(status), None),
            Verdict::Exited(Err(e)) => {
                if let Some(pid) = pid {
                    self.untrack(session, pid);
                }
                return Err(SandboxError::Io(e));
            }
            Verdict::TimedOut => {
                warn!(session = %session, command = %command.display(), "sandbox run timed out");
                let status = self.terminate(&mut child, pid).await;
                let kind = FailureKind::Timeout {
                    seconds: timeout.as_secs_f64(),
                };
                (status, Some(kind))
            }
            Verdict::Limit(metric, reason) => {
                warn!(session = %session, %metric, %reason, "sandbox limit exceeded, killing process tree");
                let status = self.terminate(&mut child, pid).await;
                (status, Some(FailureKind::LimitExceeded { metric, reason }))
            }
        };

        if let Some(pid) = pid {
            // Sweep anything the command left running in its group.
            platform::signal_group(pid, platform::Termination::Forceful);
            self.untrack(session, pid);
        }

        let grace = self.config.kill_grace;
        let (stdout, stdout_truncated) = join_output(stdout_task, grace).await;
        let (stderr, stderr_truncated) = join_output(stderr_task, grace).await;

        peak.disk_mb = peak
            .disk_mb
            .max(monitor::dir_size(&root) as f64 / (1024.0 * 1024.0));

        let failure = forced
            .or_else(|| {
                status
                    .as_ref()
                    .and_then(|s| classify_exit(s, &stderr, &limits, &enforcement, &peak))
            })
            .or_else(|| {
                let check = LimitCheck::evaluate(&peak, &limits);
                check
                    .violated
                    .contains(&Metric::Disk)
                    .then(|| FailureKind::LimitExceeded {
                        metric: Metric::Disk,
                        reason: format!(
                            "disk usage {:.1} MB exceeds limit of {} MB",
                            peak.disk_mb, limits.max_disk_mb
                        ),
                    })
            });

        if let Some(mut s) = self.sessions.get_mut(session) {
            s.cpu_spent += peak.cpu_seconds;
            let mut recorded = peak;
            recorded.cpu_seconds = s.cpu_spent;
            recorded.process_count = s.processes.len() as u32;
            s.snapshot = recorded;
        }

        let outcome = RunOutcome {
            success: failure.is_none(),
            stdout,
            stderr,
            return_code: status.as_ref().and_then(ExitStatus::code),
            resource_usage: peak,
            failure,
            enforcement,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout_truncated,
            stderr_truncated,
        };

        match &outcome.failure {
            None => debug!(
                session = %session,
                duration_ms = outcome.duration_ms,
                "sandbox run completed"
            ),
            Some(kind) => info!(
                session = %session,
                command = %command.display(),
                reason = %kind.reason(),
                "sandbox run failed"
            ),
        }

        Ok(outcome)
    }

    /// Launch a long-lived child inside `session`.
    ///
    /// Stdin and stdout are piped; stderr is appended to `logs/stderr.log`.
    /// The child's process group is owned by the session until
    /// [`cleanup`](Self::cleanup).
    pub fn spawn(&self, session: &SessionId, command: &CommandSpec) -> Result<Child> {
        let (root, limits) = self.parts(session)?;

        let log_path = root.join("logs").join(SPAWN_LOG_FILE);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut cmd = self.build_command(session, &root, &limits, command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log));

        let child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            command: command.display(),
            source,
        })?;

        if let Some(pid) = child.id() {
            self.track(session, pid);
            debug!(session = %session, pid, command = %command.display(), "sandboxed child spawned");
        }
        Ok(child)
    }

    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        let grace = self.config.kill_grace;

        if let Some(pid) = pid {
            platform::signal_group(pid, platform::Termination::Graceful);
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                return Some(status);
            }
            platform::signal_group(pid, platform::Termination::Forceful);
        }

        if let Err(e) = child.start_kill() {
            debug!(error = %e, "start_kill failed, child probably gone");
        }
        tokio::time::timeout(grace, child.wait())
            .await
            .ok()
            .and_then(std::result::Result::ok)
    }

    // -----------------------------------------------------------------------
    // Accounting
    // -----------------------------------------------------------------------

    /// Take a fresh snapshot of the session: live owned processes, CPU spent
    /// so far, scratch usage.
    pub fn snapshot(&self, session: &SessionId) -> Result<ResourceSnapshot> {
        let (root, processes, cpu_spent) = self
            .sessions
            .get(session)
            .map(|s| {
                (
                    s.root.clone(),
                    s.processes.iter().copied().collect::<Vec<_>>(),
                    s.cpu_spent,
                )
            })
            .ok_or(SandboxError::SessionNotFound(*session))?;

        let mut snapshot = Monitor::new().sample(&processes, &root);
        snapshot.cpu_seconds += cpu_spent;

        if let Some(mut s) = self.sessions.get_mut(session) {
            s.snapshot = snapshot;
        }
        Ok(snapshot)
    }

    /// Compare a fresh snapshot against the session's limits.
    pub fn check_limits(&self, session: &SessionId) -> Result<LimitCheck> {
        let (_, limits) = self.parts(session)?;
        let snapshot = self.snapshot(session)?;
        let check = LimitCheck::evaluate(&snapshot, &limits);

        if !check.valid {
            warn!(
                session = %session,
                violated = ?check.violated,
                "sandbox session over limits"
            );
        }
        Ok(check)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Kill every owned process group (SIGTERM, then SIGKILL after the grace
    /// period) and delete the scratch tree.
    ///
    /// Idempotent: cleaning an already-cleaned session returns `true` for
    /// as long as it is among the most recently retired ids.  Unknown ids
    /// return `false`.
    pub async fn cleanup(&self, session: &SessionId) -> bool {
        let Some((_, removed)) = self.sessions.remove(session) else {
            return self.retired.contains(session);
        };
        self.retired.insert(*session);

        for pgid in &removed.processes {
            platform::terminate_group(*pgid, self.config.kill_grace).await;
        }

        let ok = match tokio::fs::remove_dir_all(&removed.root).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!(
                    session = %session,
                    root = %removed.root.display(),
                    error = %e,
                    "failed to delete sandbox scratch tree"
                );
                false
            }
        };

        info!(
            session = %session,
            owner = %removed.owner_id,
            processes = removed.processes.len(),
            "sandbox session cleaned up"
        );
        ok
    }

    /// Clean up every live session.  Returns how many were cleaned fully.
    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        let mut cleaned = 0;
        for id in ids {
            if self.cleanup(&id).await {
                cleaned += 1;
            }
        }
        cleaned
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("base_dir", &self.config.base_dir)
            .field("limiter", &self.limiter.name())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes.  Returns the lossy UTF-8
/// text and whether anything was dropped.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (String, bool) {
    let Some(mut reader) = reader else {
        return (String::new(), false);
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n... [output truncated]");
    }
    (text, truncated)
}

async fn join_output(task: JoinHandle<(String, bool)>, grace: Duration) -> (String, bool) {
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(output)) => output,
        _ => (String::new(), false),
    }
}
