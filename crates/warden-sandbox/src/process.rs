//! The process sandbox.
//!
//! One sandbox owns one worker process. The parent writes protocol
//! lines to the worker's stdin and reads them from its stdout; stderr
//! is drained into the log. A heartbeat task force-kills the worker
//! after three consecutive missed acks. Executions are serialized per
//! sandbox and carry a deadline; on expiry the sandbox is terminated
//! and the caller gets a `timeout` outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use warden_core::types::AgentId;

use crate::container::ContainerSpec;
use crate::env::build_worker_env;
use crate::error::{SandboxError, SandboxResult};
use crate::ipc::{MessageKind, WorkerMessage};
use crate::workdir;

/// How the worker process is launched.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Bare process with `ulimit` ceilings applied by a shell wrapper.
    Local,
    /// Locked-down container (see [`ContainerSpec`]).
    Container(ContainerSpec),
}

/// Sandbox configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// The hosted agent.
    pub agent_id: AgentId,
    /// Worker program and arguments.
    pub entry_point: Vec<String>,
    /// Capability names passed to the worker via `CAPABILITIES`.
    pub capabilities: Vec<String>,
    /// Heap ceiling in megabytes.
    pub memory_mb: u64,
    /// Stack ceiling in kilobytes.
    pub stack_kb: u64,
    /// How long the worker has to report ready.
    pub startup_timeout: Duration,
    /// Interval between parent heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive missed acks before a force kill.
    pub max_missed_heartbeats: u32,
    /// Grace period at each escalation step of terminate.
    pub terminate_grace: Duration,
    /// Root under which working directories are created.
    pub temp_root: PathBuf,
    /// Launch mode.
    pub launch: LaunchMode,
}

impl SandboxConfig {
    /// A local-mode config with conventional limits.
    #[must_use]
    pub fn local(agent_id: AgentId, entry_point: Vec<String>) -> Self {
        Self {
            agent_id,
            entry_point,
            capabilities: Vec::new(),
            memory_mb: 512,
            stack_kb: 8192,
            startup_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            terminate_grace: Duration::from_secs(2),
            temp_root: std::env::temp_dir(),
            launch: LaunchMode::Local,
        }
    }
}

/// Sandbox lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Created, not spawned.
    Created,
    /// Worker process started, waiting for ready.
    Starting,
    /// Worker is ready for work.
    Ready,
    /// Worker is gone; the sandbox cannot be reused.
    Terminated,
}

/// The result of one execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecuteOutcome {
    /// Whether the worker reported success.
    pub success: bool,
    /// Worker-provided result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text on failure (`timeout` when the deadline expired).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent, milliseconds.
    pub duration_ms: u64,
    /// Worker-reported resident memory, megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

/// A sandbox hosting one agent's worker process.
pub struct ProcessSandbox {
    config: SandboxConfig,
    state: Mutex<SandboxState>,
    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    missed_heartbeats: AtomicU32,
    exec_lock: AsyncMutex<()>,
    cancel: CancellationToken,
    workdir: Mutex<Option<PathBuf>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>,
}

impl ProcessSandbox {
    /// Create a sandbox (not spawned yet).
    #[must_use]
    pub fn new(config: SandboxConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SandboxState::Created),
            child: AsyncMutex::new(None),
            stdin: AsyncMutex::new(None),
            pending: Mutex::new(HashMap::new()),
            ready_tx: Mutex::new(None),
            missed_heartbeats: AtomicU32::new(0),
            exec_lock: AsyncMutex::new(()),
            cancel: CancellationToken::new(),
            workdir: Mutex::new(None),
            event_tx: Mutex::new(None),
        })
    }

    /// The hosted agent's id.
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        &self.config.agent_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SandboxState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The working directory, once spawned.
    #[must_use]
    pub fn workdir(&self) -> Option<PathBuf> {
        self.workdir
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Receive worker-pushed `event` messages.
    pub fn take_event_stream(&self) -> mpsc::UnboundedReceiver<WorkerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .event_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    fn set_state(&self, next: SandboxState) {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = next;
    }

    fn build_command(&self, workdir: &PathBuf) -> SandboxResult<Command> {
        if self.config.entry_point.is_empty() {
            return Err(SandboxError::InvalidEntryPoint("empty entry point".into()));
        }
        let env = build_worker_env(
            &self.config.agent_id,
            &self.config.capabilities,
            "sandbox",
            self.config.memory_mb,
        );

        let mut command = match &self.config.launch {
            LaunchMode::Local => {
                // `ulimit` in a wrapper shell applies the address-space
                // and stack ceilings without a pre-exec hook.
                let as_kb = self.config.memory_mb.saturating_mul(1024);
                let script = format!(
                    "ulimit -v {as_kb} 2>/dev/null; ulimit -s {} 2>/dev/null; exec \"$@\"",
                    self.config.stack_kb
                );
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script).arg("warden-worker");
                cmd.args(&self.config.entry_point);
                cmd.env_clear();
                cmd.envs(&env);
                cmd.current_dir(workdir);
                cmd
            },
            LaunchMode::Container(spec) => {
                let mut cmd = Command::new("docker");
                cmd.args(spec.to_args(&self.config.entry_point, &env, workdir));
                cmd
            },
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    /// Spawn the worker and wait for its `ready` message.
    ///
    /// # Errors
    ///
    /// [`SandboxError::SpawnFailed`] when the process cannot start,
    /// [`SandboxError::StartupTimeout`] when no `ready` arrives in
    /// time (the worker is killed first).
    pub async fn spawn(self: &Arc<Self>) -> SandboxResult<()> {
        if self.state() == SandboxState::Terminated {
            return Err(SandboxError::Terminated);
        }
        let workdir = workdir::create_workdir(&self.config.temp_root, &self.config.agent_id)?;
        *self
            .workdir
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(workdir.clone());

        let mut command = self.build_command(&workdir)?;
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        self.set_state(SandboxState::Starting);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("worker stdout not captured".into()))?;
        let stderr = child.stderr.take();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed("worker stdin not captured".into()))?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let (ready_tx, ready_rx) = oneshot::channel();
        *self
            .ready_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(ready_tx);

        // Reader task: worker stdout -> protocol dispatch.
        let reader_self = Arc::clone(self);
        tokio::spawn(async move {
            reader_self.read_loop(stdout).await;
        });

        // Drain stderr into the log.
        if let Some(stderr) = stderr {
            let agent = self.config.agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent = %agent, "worker stderr: {line}");
                }
            });
        }

        // Heartbeat task.
        let heartbeat_self = Arc::clone(self);
        tokio::spawn(async move {
            heartbeat_self.heartbeat_loop().await;
        });

        // Bounded wait for ready.
        let timeout_ms = u64::try_from(self.config.startup_timeout.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(self.config.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(agent = %self.config.agent_id, "worker ready");
                Ok(())
            },
            _ => {
                warn!(agent = %self.config.agent_id, "worker failed to become ready; killing");
                self.force_kill().await;
                Err(SandboxError::StartupTimeout { timeout_ms })
            },
        }
    }

    async fn read_loop(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                () = self.cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let Some(message) = WorkerMessage::parse_line(&line) else {
                        trace!(agent = %self.config.agent_id, "ignoring non-protocol output");
                        continue;
                    };
                    self.dispatch(message);
                },
                Ok(None) | Err(_) => break,
            }
        }
        // Worker stdout closed: fail whatever is still waiting.
        self.fail_pending("worker exited");
        if self.state() != SandboxState::Terminated {
            self.set_state(SandboxState::Terminated);
        }
    }

    fn dispatch(&self, message: WorkerMessage) {
        match message.kind {
            MessageKind::Ready => {
                self.set_state(SandboxState::Ready);
                if let Some(tx) = self
                    .ready_tx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(());
                }
            },
            MessageKind::HeartbeatAck => {
                self.missed_heartbeats.store(0, Ordering::SeqCst);
            },
            MessageKind::ExecuteResult | MessageKind::Result => {
                let sender = self
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&message.id);
                if let Some(tx) = sender {
                    let _ = tx.send(message.payload);
                } else {
                    trace!(id = %message.id, "result for unknown request");
                }
            },
            MessageKind::Event => {
                let guard = self
                    .event_tx
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send(message);
                }
            },
            MessageKind::Shutdown => {
                debug!(agent = %self.config.agent_id, "worker acknowledged shutdown");
            },
            MessageKind::Error => {
                warn!(agent = %self.config.agent_id, payload = %message.payload, "worker error");
            },
            // Parent-to-worker kinds echoed back, or future types.
            _ => trace!(agent = %self.config.agent_id, "ignoring message kind"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.heartbeat_interval) => {},
            }
            let outstanding = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst);
            if outstanding >= self.config.max_missed_heartbeats {
                warn!(
                    agent = %self.config.agent_id,
                    outstanding,
                    "heartbeat acks missing; force killing worker"
                );
                self.force_kill().await;
                return;
            }
            let message = WorkerMessage::new(
                MessageKind::Heartbeat,
                Uuid::new_v4().to_string(),
                Value::Null,
            );
            if self.send(&message).await.is_err() {
                return;
            }
        }
    }

    async fn send(&self, message: &WorkerMessage) -> SandboxResult<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(SandboxError::Ipc("worker stdin closed".into()));
        };
        stdin
            .write_all(message.to_line().as_bytes())
            .await
            .map_err(|e| SandboxError::Ipc(e.to_string()))?;
        stdin.flush().await.map_err(|e| SandboxError::Ipc(e.to_string()))
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<oneshot::Sender<Value>> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(json!({"success": false, "error": reason}));
        }
    }

    /// Execute a task in the worker under `deadline`.
    ///
    /// Executions are serial per sandbox; a second caller waits for
    /// the first to finish. On deadline expiry the sandbox is
    /// terminated and the outcome carries `error = "timeout"`.
    ///
    /// # Errors
    ///
    /// [`SandboxError::Terminated`] when the sandbox is not usable,
    /// [`SandboxError::Ipc`] when the request cannot reach the worker.
    pub async fn execute(
        self: &Arc<Self>,
        task: Value,
        deadline: Duration,
    ) -> SandboxResult<ExecuteOutcome> {
        if self.state() != SandboxState::Ready {
            return Err(SandboxError::Terminated);
        }
        let _serial = self.exec_lock.lock().await;
        if self.state() != SandboxState::Ready {
            return Err(SandboxError::Terminated);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.clone(), tx);

        let deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        let message = WorkerMessage::new(
            MessageKind::Execute,
            id.clone(),
            json!({"task": task, "deadline_ms": deadline_ms}),
        );
        let started = Instant::now();
        if let Err(e) = self.send(&message).await {
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(payload)) => Ok(Self::outcome_from(payload, started)),
            Ok(Err(_)) => Ok(ExecuteOutcome {
                success: false,
                result: None,
                error: Some("worker exited".to_string()),
                duration_ms: elapsed_ms(started),
                memory_mb: None,
            }),
            Err(_) => {
                let duration_ms = elapsed_ms(started);
                self.pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&id);
                warn!(agent = %self.config.agent_id, deadline_ms, "execution deadline expired");
                self.terminate().await;
                Ok(ExecuteOutcome {
                    success: false,
                    result: None,
                    error: Some("timeout".to_string()),
                    duration_ms,
                    memory_mb: None,
                })
            },
        }
    }

    fn outcome_from(payload: Value, started: Instant) -> ExecuteOutcome {
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        ExecuteOutcome {
            success,
            result: payload.get("result").cloned(),
            error: payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            duration_ms: elapsed_ms(started),
            memory_mb: payload.get("memory_mb").and_then(Value::as_f64),
        }
    }

    /// Graceful shutdown: terminate IPC, then SIGTERM, then SIGKILL,
    /// each separated by the configured grace period. The working
    /// directory is removed afterwards.
    pub async fn terminate(self: &Arc<Self>) {
        if self.state() == SandboxState::Terminated {
            return;
        }
        self.set_state(SandboxState::Terminated);

        let message = WorkerMessage::new(MessageKind::Terminate, Uuid::new_v4().to_string(), Value::Null);
        let _ = self.send(&message).await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let grace = self.config.terminate_grace;
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                send_sigterm(&child);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        self.cleanup();
    }

    /// Immediate SIGKILL and cleanup.
    pub async fn force_kill(self: &Arc<Self>) {
        self.set_state(SandboxState::Terminated);
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.cleanup();
    }

    fn cleanup(&self) {
        self.cancel.cancel();
        self.fail_pending("sandbox terminated");
        let workdir = self
            .workdir
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(path) = workdir {
            if let Err(e) = workdir::remove_workdir(&self.config.temp_root, &path) {
                warn!(path = %path.display(), error = %e, "failed to remove workdir");
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn send_sigterm(child: &Child) {
    let Some(pid) = child.id() else { return };
    let Ok(pid) = i32::try_from(pid) else { return };
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    );
}

impl std::fmt::Debug for ProcessSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSandbox")
            .field("agent_id", &self.config.agent_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A worker that speaks just enough protocol for tests: announce
    /// ready, ack heartbeats, answer executes after an optional sleep.
    fn stub_worker(config: &mut SandboxConfig, execute_sleep_secs: u64) {
        let script = format!(
            concat!(
                "echo '{{\"type\":\"ready\",\"id\":\"0\",\"ts\":0}}'; ",
                "while read -r line; do ",
                "case \"$line\" in ",
                "*heartbeat*) echo \"$line\" | sed 's/heartbeat/heartbeat_ack/' ;; ",
                "*execute*) sleep {}; ",
                "id=$(printf %s \"$line\" | sed 's/.*\"id\":\"\\([^\"]*\\)\".*/\\1/'); ",
                "echo \"{{\\\"type\\\":\\\"execute_result\\\",\\\"id\\\":\\\"$id\\\",",
                "\\\"payload\\\":{{\\\"success\\\":true,\\\"result\\\":42,\\\"memory_mb\\\":1.5}},\\\"ts\\\":0}}\" ;; ",
                "*terminate*) echo '{{\"type\":\"shutdown\",\"id\":\"0\",\"ts\":0}}'; exit 0 ;; ",
                "esac; done"
            ),
            execute_sleep_secs
        );
        config.entry_point = vec!["sh".to_string(), "-c".to_string(), script];
    }

    fn test_config(temp: &std::path::Path) -> SandboxConfig {
        let mut config = SandboxConfig::local(AgentId::new(), vec![]);
        config.temp_root = temp.to_path_buf();
        config.startup_timeout = Duration::from_secs(5);
        config.heartbeat_interval = Duration::from_millis(200);
        config.terminate_grace = Duration::from_millis(300);
        // The stub worker runs under the ulimit wrapper like any other
        // entry point; generous ceilings so `sh` itself fits.
        config.memory_mb = 1024;
        config
    }

    #[tokio::test]
    async fn test_spawn_failure_on_missing_binary() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.entry_point = vec!["/nonexistent/warden-test-worker".to_string()];
        config.startup_timeout = Duration::from_millis(500);
        let sandbox = ProcessSandbox::new(config);
        // The wrapper shell starts, fails to exec, and never reports
        // ready; spawn surfaces a startup timeout.
        let err = sandbox.spawn().await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::StartupTimeout { .. } | SandboxError::SpawnFailed(_)
        ));
        assert_eq!(sandbox.state(), SandboxState::Terminated);
    }

    #[tokio::test]
    async fn test_spawn_execute_terminate() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        stub_worker(&mut config, 0);
        let sandbox = ProcessSandbox::new(config);

        sandbox.spawn().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Ready);
        let workdir = sandbox.workdir().unwrap();
        assert!(workdir.exists());

        let outcome = sandbox
            .execute(json!({"type": "noop"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!(42)));
        assert_eq!(outcome.memory_mb, Some(1.5));

        sandbox.terminate().await;
        assert_eq!(sandbox.state(), SandboxState::Terminated);
        assert!(!workdir.exists());

        // A terminated sandbox refuses further work.
        let err = sandbox
            .execute(json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Terminated));
    }

    #[tokio::test]
    async fn test_execute_timeout_terminates_sandbox() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        stub_worker(&mut config, 10);
        let sandbox = ProcessSandbox::new(config);
        sandbox.spawn().await.unwrap();

        let outcome = sandbox
            .execute(json!({"type": "slow"}), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("timeout"));
        assert!(outcome.duration_ms >= 90);
        assert!(outcome.duration_ms < 5_000);
        assert_eq!(sandbox.state(), SandboxState::Terminated);
        assert!(sandbox.workdir().is_none());
    }
}
