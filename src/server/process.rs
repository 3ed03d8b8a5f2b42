//! Spawned server processes.
//!
//! A [`ProcessHandle`] fronts the child process of a stdio or sse server.
//! The `Child` itself is owned by a background task; termination requests
//! travel over a control channel and the exit status is published on a
//! watch channel. Exit observation and operator-initiated termination
//! therefore never contend on the same handle, which is what lets the
//! supervisor serialize "process exited" against "operator stop".

use crate::error::{Error, Result};
use crate::server::registry::ServerConfig;
use crate::transport::StdioPipes;

use async_process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// How often the owning task looks for an exit between commands.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Terminal state of a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub success: bool,
    /// Exit code, absent when the process died to a signal.
    pub code: Option<i32>,
}

enum ProcessCommand {
    Terminate {
        grace: Duration,
        done: oneshot::Sender<ProcessExit>,
    },
}

/// Handle to a spawned server process.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    pid: u32,
    control: mpsc::Sender<ProcessCommand>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

/// A freshly spawned server process and its captured streams.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    /// Standard streams carrying frames; present when spawned for the
    /// stdio wire, absent when the transport runs elsewhere (sse).
    pub pipes: Option<StdioPipes>,
    /// Stdout for log capture when it does not carry frames.
    pub stdout_log: Option<ChildStdout>,
    /// Stderr, always captured for logging only.
    pub stderr: ChildStderr,
}

impl ProcessHandle {
    /// Spawns the configured command with the config's environment merged
    /// over the inherited one. With `wire_stdio` the child's standard
    /// streams carry frames and are returned as pipes; otherwise stdin is
    /// closed immediately and stdout joins stderr in the log capture.
    pub fn spawn(name: &str, config: &ServerConfig, wire_stdio: bool) -> Result<SpawnedProcess> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }
        let stdin = if wire_stdio {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn {}: {}", config.command, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("no stdout pipe on spawned process".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("no stderr pipe on spawned process".to_string()))?;
        let (pipes, stdout_log) = if wire_stdio {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::Process("no stdin pipe on spawned process".to_string()))?;
            (Some(StdioPipes { stdin, stdout }), None)
        } else {
            (None, Some(stdout))
        };

        let pid = child.id();
        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(own_child(name.to_string(), child, control_rx, exit_tx));

        tracing::debug!(server = %name, pid, "Spawned server process");
        Ok(SpawnedProcess {
            handle: Self {
                pid,
                control: control_tx,
                exit: exit_rx,
            },
            pipes,
            stdout_log,
            stderr,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process has already exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Waits for the process to exit and returns its terminal state.
    pub async fn wait(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        loop {
            if let Some(status) = *exit.borrow() {
                return status;
            }
            if exit.changed().await.is_err() {
                // Owning task is gone without publishing; treat as failure.
                return ProcessExit {
                    success: false,
                    code: None,
                };
            }
        }
    }

    /// Terminates the process: waits up to `grace` for a self-initiated
    /// exit (the adapter has already closed stdin), then kills it.
    pub async fn terminate(&self, grace: Duration) -> Result<ProcessExit> {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .control
            .send(ProcessCommand::Terminate {
                grace,
                done: done_tx,
            })
            .await;
        if sent.is_err() {
            // Owning task already finished: the process has exited.
            return Ok(self.wait().await);
        }
        match done_rx.await {
            Ok(exit) => Ok(exit),
            // The owner observed a natural exit before reading the request.
            Err(_) => Ok(self.wait().await),
        }
    }
}

fn exit_of(status: std::io::Result<std::process::ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) => ProcessExit {
            success: status.success(),
            code: status.code(),
        },
        Err(_) => ProcessExit {
            success: false,
            code: None,
        },
    }
}

/// The task that owns the `Child`: polls for exit, services terminations.
async fn own_child(
    name: String,
    mut child: Child,
    mut control: mpsc::Receiver<ProcessCommand>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let mut control_open = true;
    let exit = loop {
        match child.try_status() {
            Ok(Some(status)) => break exit_of(Ok(status)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "Failed to poll process status");
                break exit_of(Err(e));
            }
        }

        tokio::select! {
            cmd = control.recv(), if control_open => match cmd {
                Some(ProcessCommand::Terminate { grace, done }) => {
                    let exit = terminate_child(&name, &mut child, grace).await;
                    let _ = done.send(exit);
                    break exit;
                }
                None => control_open = false,
            },
            _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
        }
    };

    tracing::debug!(server = %name, success = exit.success, code = ?exit.code, "Server process exited");
    let _ = exit_tx.send(Some(exit));
}

async fn terminate_child(name: &str, child: &mut Child, grace: Duration) -> ProcessExit {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        match child.try_status() {
            Ok(Some(status)) => return exit_of(Ok(status)),
            Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
            Err(e) => return exit_of(Err(e)),
        }
    }

    tracing::warn!(server = %name, "Grace period elapsed, killing process");
    if let Err(e) = child.kill() {
        tracing::warn!(server = %name, error = %e, "Failed to kill process");
    }
    exit_of(child.status().await)
}
