//! A live plugin process and its request/response channel.

use std::collections::BTreeSet;
use std::process::ExitStatus;
use std::time::Duration;

use futures::StreamExt;
use plughost_sandbox::{SessionId, Termination};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::error::{ExecutorError, Result};
use crate::protocol::{self, CLEANUP, INITIALIZE, InitializeReply, Request, Response};

/// Longest stdout line accepted from a plugin unless configured otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// One spawned plugin.  Calls are strictly sequential; the owner serializes
/// access.
pub struct PluginInstance {
    plugin_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: FramedRead<ChildStdout, LinesCodec>,
    next_id: u64,
    methods: BTreeSet<String>,
    session: Option<SessionId>,
    process_group: Option<u32>,
}

impl PluginInstance {
    /// Take ownership of a child whose stdin and stdout are piped.
    pub fn attach(
        plugin_id: impl Into<String>,
        mut child: Child,
        session: Option<SessionId>,
    ) -> Result<Self> {
        let plugin_id = plugin_id.into();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExecutorError::load(
                plugin_id,
                "plugin process was spawned without piped stdio",
            ));
        };
        Ok(Self {
            plugin_id,
            child,
            stdin: Some(stdin),
            stdout: FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(DEFAULT_MAX_LINE_BYTES),
            ),
            next_id: 1,
            methods: BTreeSet::new(),
            session,
            process_group: None,
        })
    }

    /// The child was spawned as the leader of its own process group; kill
    /// the whole group on teardown.
    pub fn with_process_group(mut self) -> Self {
        self.process_group = self.child.id();
        self
    }

    /// Reject stdout lines longer than `max` bytes.
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        *self.stdout.decoder_mut() = LinesCodec::new_with_max_length(max);
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Methods advertised by `initialize`.
    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    pub fn supports(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Perform the `initialize` handshake and record the advertised methods.
    pub async fn initialize(&mut self, params: Value, timeout: Duration) -> Result<()> {
        let reply = match self.call(INITIALIZE, params, timeout).await {
            Ok(reply) => reply,
            Err(ExecutorError::Execution { reason, .. }) => {
                return Err(ExecutorError::load(&self.plugin_id, reason));
            }
            Err(e) => return Err(e),
        };

        let reply: InitializeReply = serde_json::from_value(reply).map_err(|e| {
            ExecutorError::load(&self.plugin_id, format!("malformed initialize reply: {e}"))
        })?;
        if !reply.success {
            return Err(ExecutorError::load(
                &self.plugin_id,
                reply
                    .error
                    .unwrap_or_else(|| "initialize reported failure".to_owned()),
            ));
        }

        self.methods = reply.methods.into_iter().collect();
        debug!(
            plugin_id = %self.plugin_id,
            methods = ?self.methods,
            "plugin initialized"
        );
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// A plugin-reported error comes back as [`ExecutorError::Execution`];
    /// timeouts and a vanished process are fatal for the instance.
    pub async fn call(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let line = protocol::encode(&Request::new(id, method, params))
            .map_err(|e| ExecutorError::Protocol(format!("cannot encode `{method}` request: {e}")))?;

        let response = tokio::time::timeout(timeout, self.exchange(id, method, &line))
            .await
            .map_err(|_| ExecutorError::Timeout {
                plugin_id: self.plugin_id.clone(),
                seconds: timeout.as_secs_f64(),
            })??;

        response
            .into_outcome()
            .map_err(|reason| ExecutorError::Execution {
                plugin_id: self.plugin_id.clone(),
                reason,
            })
    }

    async fn exchange(&mut self, id: u64, method: &str, line: &str) -> Result<Response> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExecutorError::Protocol("plugin stdin already closed".into()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        loop {
            let line = match self.stdout.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(ExecutorError::Protocol(format!(
                        "plugin `{}` wrote an oversized line while answering `{method}`",
                        self.plugin_id
                    )));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                None => {
                    return Err(ExecutorError::Protocol(format!(
                        "plugin `{}` exited before answering `{method}`",
                        self.plugin_id
                    )));
                }
            };
            match protocol::decode_response(&line) {
                Some(response) if response.id == id => return Ok(response),
                Some(response) => debug!(
                    plugin_id = %self.plugin_id,
                    expected = id,
                    got = response.id,
                    "discarding stale response"
                ),
                None => debug!(plugin_id = %self.plugin_id, line = %line, "plugin output"),
            }
        }
    }

    /// Say goodbye and wait for the process to exit, killing it after
    /// `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        if self.supports(CLEANUP) {
            if let Err(e) = self.call(CLEANUP, Value::Null, grace).await {
                debug!(plugin_id = %self.plugin_id, error = %e, "plugin cleanup call failed");
            }
        }
        drop(self.stdin.take());

        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            // Anything the plugin forked gets the same grace period.
            if let Some(pgid) = self.process_group {
                plughost_sandbox::terminate_group(pgid, grace).await;
            }
            return Some(status);
        }
        self.kill().await
    }

    /// Kill the process, and its process group if it leads one, without
    /// ceremony.
    pub async fn kill(mut self) -> Option<ExitStatus> {
        drop(self.stdin.take());
        if let Some(pgid) = self.process_group {
            plughost_sandbox::signal_group(pgid, Termination::Forceful);
        }
        if let Err(e) = self.child.start_kill() {
            debug!(plugin_id = %self.plugin_id, error = %e, "start_kill failed, process already gone");
        }
        self.child.wait().await.ok()
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("plugin_id", &self.plugin_id)
            .field("pid", &self.child.id())
            .field("methods", &self.methods)
            .field("session", &self.session)
            .field("process_group", &self.process_group)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::process::Stdio;
    use tokio::process::Command;

    fn shell_plugin(script: &str) -> PluginInstance {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        PluginInstance::attach("shell", child, None).unwrap()
    }

    #[tokio::test]
    async fn skips_noise_and_matches_ids() {
        let mut instance = shell_plugin(
            r#"read line; echo "booting"; echo '{"id":1,"result":{"methods":["process"]}}'; read line; echo '{"id":99,"result":0}'; echo '{"id":2,"result":"done"}'; cat >/dev/null"#,
        );
        instance
            .initialize(json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(instance.supports("process"));

        let value = instance
            .call("process", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!("done"));
        instance.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn plugin_error_is_not_fatal() {
        let mut instance = shell_plugin(r#"read line; echo '{"id":1,"error":"bad input"}'; cat >/dev/null"#);
        let err = instance
            .call("process", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Execution { ref reason, .. } if reason == "bad input"));
        assert!(!err.is_fatal());
        instance.kill().await;
    }

    #[tokio::test]
    async fn silent_plugin_times_out() {
        let mut instance = shell_plugin("sleep 5");
        let err = instance
            .call("process", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
        assert!(err.is_fatal());
        instance.kill().await;
    }

    #[tokio::test]
    async fn exited_plugin_is_a_protocol_error() {
        let mut instance = shell_plugin("read line; exit 0");
        let err = instance
            .call("process", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol(_)), "{err}");
        instance.kill().await;
    }

    #[tokio::test]
    async fn oversized_line_is_a_protocol_error() {
        let mut instance = shell_plugin(&format!(
            "read line; printf '{}'; cat >/dev/null",
            "x".repeat(64)
        ))
        .with_max_line_bytes(16);
        let err = instance
            .call("process", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Protocol(ref m) if m.contains("oversized")), "{err}");
        assert!(err.is_fatal());
        instance.kill().await;
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
    #[tokio::test]
    async fn kill_takes_down_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!(
                "sleep 30 & echo $! > '{}'; cat >/dev/null",
                pid_file.display()
            ))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let instance = PluginInstance::attach("forker", child, None)
            .unwrap()
            .with_process_group();

        let mut helper = None;
        for _ in 0..100 {
            if let Some(pid) = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok())
            {
                helper = Some(pid);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let helper = helper.expect("helper pid recorded");
        assert!(process_running(helper));

        instance.kill().await;

        let mut gone = false;
        for _ in 0..100 {
            if !process_running(helper) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "forked helper {helper} survived kill");
    }

    #[tokio::test]
    async fn failed_initialize_is_a_load_error() {
        let mut instance = shell_plugin(
            r#"read line; echo '{"id":1,"result":{"success":false,"error":"missing api key"}}'; cat >/dev/null"#,
        );
        let err = instance
            .initialize(json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing api key"));
        instance.kill().await;
    }
}
