//! RPC process management
//!
//! Handles spawning the agent binary in RPC mode, including:
//! - Newline-delimited JSON framing on stdout
//! - Fire-and-forget command writes on stdin
//! - Verbatim stderr forwarding
//! - Graceful kill with a forced fallback

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Grace window between a kill request and forced termination
pub const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Events emitted by an RPC process
///
/// All events carry the session ID of the owning session so that a single
/// receiver can serve every process managed by the bridge.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete JSON event read from the agent's stdout
    Event { session: Uuid, payload: Value },
    /// A non-empty diagnostic line from the agent's stderr
    Stderr { session: Uuid, line: String },
    /// The agent process exited (sent exactly once per process)
    Exited { session: Uuid, code: Option<i32> },
}

/// Handle to a running agent process in RPC mode
///
/// Commands are queued onto stdin as one JSON value per line. Once the
/// process has been asked to stop, or its stdin has failed, further sends
/// are silently dropped.
pub struct RpcProcess {
    /// Queue of commands bound for the agent's stdin
    stdin_tx: mpsc::UnboundedSender<Value>,
    /// Kill signal (idempotent; subscribers race to the same grace window)
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcProcess {
    /// Spawn the agent binary rooted at the given working directory
    ///
    /// If `session_path` is supplied, a `switch_session` command is issued
    /// immediately so the agent resumes that transcript.
    ///
    /// Spawn failure is not an error from this constructor: it is reported
    /// through `events_tx` as a `Stderr` line followed by an `Exited` event,
    /// the same way a crashing agent would be.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        session_path: Option<PathBuf>,
        session: Uuid,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Value>();
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut child = match Command::new(command)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start agent process for session {}: {}", session, e);
                let _ = events_tx.send(TransportEvent::Stderr {
                    session,
                    line: format!("failed to start agent process: {}", e),
                });
                let _ = events_tx.send(TransportEvent::Exited {
                    session,
                    code: None,
                });
                return Self {
                    stdin_tx,
                    shutdown_tx,
                };
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Self::start_writer(stdin_rx, stdin, shutdown_tx.subscribe(), session);
        let stdout_task = Self::start_stdout_reader(stdout, events_tx.clone(), session);
        let stderr_task = Self::start_stderr_reader(stderr, events_tx.clone(), session);
        Self::start_exit_watcher(
            child,
            events_tx,
            shutdown_tx.subscribe(),
            stdout_task,
            stderr_task,
            session,
        );

        let process = Self {
            stdin_tx,
            shutdown_tx,
        };

        if let Some(path) = session_path {
            process.send(json!({
                "type": "switch_session",
                "sessionPath": path.to_string_lossy(),
            }));
        }

        process
    }

    /// Queue a command for the agent's stdin
    ///
    /// Fire-and-forget: if the process is stopping or stdin is no longer
    /// writable, the command is dropped without blocking the caller.
    pub fn send(&self, command: Value) {
        let _ = self.stdin_tx.send(command);
    }

    /// Request termination of the agent process
    ///
    /// Idempotent. Closes the agent's stdin to request a graceful exit; if
    /// the process has not exited within [`KILL_GRACE`], it is force-killed.
    /// The exit watcher delivers the `Exited` event either way.
    pub fn kill(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Writer task: drains the command queue onto the process stdin
    fn start_writer(
        mut stdin_rx: mpsc::UnboundedReceiver<Value>,
        stdin: Option<tokio::process::ChildStdin>,
        mut shutdown_rx: broadcast::Receiver<()>,
        session: Uuid,
    ) {
        let Some(mut stdin) = stdin else {
            return;
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    command = stdin_rx.recv() => {
                        let Some(command) = command else {
                            break;
                        };
                        let mut line = command.to_string();
                        line.push('\n');
                        if stdin.write_all(line.as_bytes()).await.is_err() {
                            debug!("Agent stdin closed for session {}, dropping commands", session);
                            break;
                        }
                        if stdin.flush().await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping stdin closes the pipe, which is the graceful exit
            // request for an RPC-mode agent.
        });
    }

    /// Reader task: frames stdout into JSON events by newline
    fn start_stdout_reader(
        stdout: Option<tokio::process::ChildStdout>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        session: Uuid,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let stdout = stdout?;

        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(payload) => {
                        if events_tx
                            .send(TransportEvent::Event { session, payload })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(_) => {
                        // The agent may emit non-JSON noise; it must not
                        // bring down the bridge.
                        debug!("Dropping malformed agent output line: {}", line);
                    }
                }
            }
        }))
    }

    /// Reader task: forwards non-empty stderr lines verbatim
    fn start_stderr_reader(
        stderr: Option<tokio::process::ChildStderr>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        session: Uuid,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let stderr = stderr?;

        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if events_tx
                    .send(TransportEvent::Stderr { session, line })
                    .is_err()
                {
                    break;
                }
            }
        }))
    }

    /// Watcher task: owns the child and reports its exit exactly once
    ///
    /// Waits for the reader tasks to drain before emitting the exit event so
    /// that clients see every event the process produced before the terminal
    /// notification.
    fn start_exit_watcher(
        mut child: tokio::process::Child,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
        stdout_task: Option<tokio::task::JoinHandle<()>>,
        stderr_task: Option<tokio::task::JoinHandle<()>>,
        session: Uuid,
    ) {
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = shutdown_rx.recv() => {
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(status) => status.ok(),
                        Err(_) => {
                            warn!("Agent for session {} did not exit within grace window, killing", session);
                            let _ = child.start_kill();
                            child.wait().await.ok()
                        }
                    }
                }
            };

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let code = status.and_then(|s| s.code());
            debug!("Agent process for session {} exited with code {:?}", session, code);
            let _ = events_tx.send(TransportEvent::Exited { session, code });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_sh(
        script: &str,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        session: Uuid,
    ) -> RpcProcess {
        RpcProcess::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            Path::new("/tmp"),
            None,
            session,
            events_tx,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        let _process = RpcProcess::spawn(
            "/nonexistent/agent/binary",
            &[],
            Path::new("/tmp"),
            None,
            session,
            tx,
        );

        match recv(&mut rx).await {
            TransportEvent::Stderr { session: s, .. } => assert_eq!(s, session),
            other => panic!("Expected Stderr, got {:?}", other),
        }
        match recv(&mut rx).await {
            TransportEvent::Exited { session: s, code } => {
                assert_eq!(s, session);
                assert_eq!(code, None);
            }
            other => panic!("Expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stdout_lines_become_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        let script = r#"printf '%s\n' '{"type":"agent_start"}'; printf '%s\n' 'not json'; printf '%s\n' '{"type":"agent_end"}'"#;
        let _process = spawn_sh(script, tx, session);

        match recv(&mut rx).await {
            TransportEvent::Event { payload, .. } => {
                assert_eq!(payload["type"], "agent_start");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        // The malformed line is dropped; the next event follows directly
        match recv(&mut rx).await {
            TransportEvent::Event { payload, .. } => {
                assert_eq!(payload["type"], "agent_end");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
        match recv(&mut rx).await {
            TransportEvent::Exited { .. } => {}
            other => panic!("Expected Exited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stderr_forwarded_verbatim() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        let _process = spawn_sh("echo 'agent panic' >&2", tx, session);

        loop {
            match recv(&mut rx).await {
                TransportEvent::Stderr { line, .. } => {
                    assert_eq!(line, "agent panic");
                    break;
                }
                TransportEvent::Exited { .. } => panic!("Exited before stderr was seen"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_send_reaches_stdin() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        // cat echoes every command line straight back as an event
        let process = spawn_sh("cat", tx, session);

        process.send(json!({"type": "prompt", "message": "hi"}));

        match recv(&mut rx).await {
            TransportEvent::Event { payload, .. } => {
                assert_eq!(payload["type"], "prompt");
                assert_eq!(payload["message"], "hi");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_kill_delivers_single_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        // Keep a sender alive so channel closure cannot masquerade as (or
        // hide) a duplicate event when checking for a second exit below.
        let process = spawn_sh("cat", tx.clone(), session);

        process.kill();
        process.kill(); // idempotent

        match recv(&mut rx).await {
            TransportEvent::Exited { session: s, .. } => assert_eq!(s, session),
            other => panic!("Expected Exited, got {:?}", other),
        }
        // No second exit event
        let extra = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "received an event after exit: {:?}", extra);
        drop(tx);
    }

    #[tokio::test]
    async fn test_send_after_kill_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4();
        let process = spawn_sh("cat", tx, session);

        process.kill();
        match recv(&mut rx).await {
            TransportEvent::Exited { .. } => {}
            other => panic!("Expected Exited, got {:?}", other),
        }

        // Must not panic or block
        process.send(json!({"type": "prompt"}));
    }
}
