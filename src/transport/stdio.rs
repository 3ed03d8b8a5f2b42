//! Stdio transport: newline-delimited JSON frames over a child process's
//! standard streams.
//!
//! The root adapter owns the read loop on the child's stdout and the shared
//! stdin writer; `bind` mints per-connection taps over the same process.
//! Spawning and reaping the process itself is the supervisor's business
//! (see `server::process`); the adapter only ever sees the pipes.

use crate::error::{Error, Result};
use crate::transport::{Frame, Upcalls};

use async_process::{ChildStdin, ChildStdout};
use futures_lite::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use futures_lite::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const FANOUT_CAPACITY: usize = 256;

/// The standard-stream pair of an already-spawned process.
///
/// Produced by `ProcessHandle::spawn` for supervisor-owned servers, or
/// supplied by whoever owns the client process when a stdio client binds.
pub struct StdioPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

struct StdioInner {
    name: String,
    /// Shared write half of the process's stdin; taken when the root closes.
    writer: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    /// Read half of the process's stdout; taken by the root's `start()`.
    source: Mutex<Option<ChildStdout>>,
    inbound_tx: Mutex<Option<tokio::sync::broadcast::Sender<Frame>>>,
    subscription: Mutex<Option<tokio::sync::broadcast::Receiver<Frame>>>,
    upcalls: Upcalls,
    is_root: bool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Adapter over a process's standard streams.
#[derive(Clone)]
pub struct StdioAdapter {
    inner: Arc<StdioInner>,
}

impl StdioAdapter {
    /// Binds a root adapter to the pipes of a process owned elsewhere.
    pub fn from_pipes(name: impl Into<String>, pipes: StdioPipes) -> Self {
        let name = name.into();
        let (inbound_tx, _) = tokio::sync::broadcast::channel(FANOUT_CAPACITY);
        Self {
            inner: Arc::new(StdioInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                writer: Arc::new(tokio::sync::Mutex::new(Some(pipes.stdin))),
                source: Mutex::new(Some(pipes.stdout)),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                subscription: Mutex::new(None),
                is_root: true,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn upcalls(&self) -> &Upcalls {
        &self.inner.upcalls
    }

    /// Starts the inbound reader (root) or tap pump (bound). Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.upcalls.is_closed() {
            return Err(Error::Transport(format!(
                "stdio adapter {} is closed",
                self.inner.name
            )));
        }

        let task = if self.inner.is_root {
            let stdout = self
                .inner
                .source
                .lock()
                .expect("lock poisoned")
                .take()
                .ok_or_else(|| {
                    Error::Transport(format!("stdio adapter {} has no stdout", self.inner.name))
                })?;
            self.spawn_reader(stdout)
        } else {
            let rx = self
                .inner
                .subscription
                .lock()
                .expect("lock poisoned")
                .take()
                .ok_or_else(|| {
                    Error::Transport(format!(
                        "stdio adapter {} has no subscription",
                        self.inner.name
                    ))
                })?;
            self.spawn_tap_pump(rx)
        };

        self.inner.tasks.lock().expect("lock poisoned").push(task);
        Ok(())
    }

    fn spawn_reader(&self, stdout: ChildStdout) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => match Frame::from_line(&line) {
                        Ok(frame) => {
                            let publisher = {
                                let slot = inner.inbound_tx.lock().expect("lock poisoned");
                                slot.clone()
                            };
                            if let Some(tx) = publisher {
                                let _ = tx.send(frame.clone());
                            }
                            inner.upcalls.deliver_frame(frame);
                        }
                        Err(e) => {
                            // Non-frame noise on stdout is logged and skipped.
                            tracing::warn!(
                                server = %inner.name,
                                error = %e,
                                "Skipping unparseable stdout line"
                            );
                        }
                    },
                    Err(e) => {
                        inner
                            .upcalls
                            .deliver_error(Error::Transport(format!("stdout read failed: {}", e)));
                        break;
                    }
                }
            }
            inner.inbound_tx.lock().expect("lock poisoned").take();
            inner.upcalls.signal_close();
        })
    }

    fn spawn_tap_pump(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<Frame>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => inner.upcalls.deliver_frame(frame),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            adapter = %inner.name,
                            missed,
                            "Stdio tap lagged, frames skipped"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.upcalls.signal_close();
        })
    }

    /// Writes one frame to the process's stdin as a JSON line.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let line = frame.to_line()?;
        let mut guard = self.inner.writer.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            Error::Transport(format!("stdio adapter {} is closed", self.inner.name))
        })?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("failed to write to stdin: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("failed to flush stdin: {}", e)))?;
        Ok(())
    }

    /// Closes the adapter. On the root this drops the stdin write half
    /// (EOF is the graceful shutdown signal for a stdio server) and closes
    /// every bound tap; a tap close leaves the root and process untouched.
    pub async fn close(&self) {
        if self.inner.is_root {
            self.inner.writer.lock().await.take();
            self.inner.inbound_tx.lock().expect("lock poisoned").take();
        }
        let tasks: Vec<JoinHandle<()>> =
            self.inner.tasks.lock().expect("lock poisoned").drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.upcalls.signal_close();
    }

    /// Mints a tap over the same process: shared stdin, broadcast stdout.
    pub fn bind(&self, name: impl Into<String>) -> Result<StdioAdapter> {
        let subscription = {
            let slot = self.inner.inbound_tx.lock().expect("lock poisoned");
            slot.as_ref().map(|tx| tx.subscribe())
        };
        let subscription = subscription.ok_or_else(|| {
            Error::Transport(format!(
                "stdio adapter {} cannot be bound (closed or already a tap)",
                self.inner.name
            ))
        })?;

        let name = name.into();
        Ok(StdioAdapter {
            inner: Arc::new(StdioInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                writer: Arc::clone(&self.inner.writer),
                source: Mutex::new(None),
                inbound_tx: Mutex::new(None),
                subscription: Mutex::new(Some(subscription)),
                is_root: false,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}
