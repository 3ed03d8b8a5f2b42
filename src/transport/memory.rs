//! In-memory transport: a linked pair of adapters that mutually deliver.
//!
//! `MemoryAdapter::pair` creates two endpoints; a frame sent on one arrives
//! on the other's frame handler. Closing either side closes both. This is
//! the transport in-process backends terminate, and the test suite's
//! stand-in for real processes and sockets.

use crate::error::{Error, Result};
use crate::transport::{Frame, Upcalls};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const FANOUT_CAPACITY: usize = 256;

struct MemoryInner {
    name: String,
    /// Write path into the peer endpoint; taken on close.
    peer_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Inbound frames from the peer; taken by `start()` on a root endpoint.
    source: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    /// Fan-out publisher; dropping it closes every bound tap.
    inbound_tx: Mutex<Option<broadcast::Sender<Frame>>>,
    /// Tap subscription; present on bound adapters only.
    subscription: Mutex<Option<broadcast::Receiver<Frame>>>,
    upcalls: Upcalls,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One endpoint of a linked in-process channel pair.
#[derive(Clone)]
pub struct MemoryAdapter {
    inner: Arc<MemoryInner>,
}

impl MemoryAdapter {
    /// Creates a linked pair of endpoints that mutually deliver.
    pub fn pair(left_name: impl Into<String>, right_name: impl Into<String>) -> (Self, Self) {
        let (to_right, from_left) = mpsc::unbounded_channel();
        let (to_left, from_right) = mpsc::unbounded_channel();

        let left = Self::endpoint(left_name.into(), to_right, from_right);
        let right = Self::endpoint(right_name.into(), to_left, from_left);
        (left, right)
    }

    fn endpoint(
        name: String,
        peer_tx: mpsc::UnboundedSender<Frame>,
        source: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        let (inbound_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                peer_tx: Mutex::new(Some(peer_tx)),
                source: Mutex::new(Some(source)),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                subscription: Mutex::new(None),
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

    /// Starts the inbound pump. Idempotent once started.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.upcalls.is_closed() {
            return Err(Error::Transport(format!(
                "memory adapter {} is closed",
                self.inner.name
            )));
        }

        let subscription = self.inner.subscription.lock().expect("lock poisoned").take();
        let task = if let Some(rx) = subscription {
            self.spawn_tap_pump(rx)
        } else {
            let source = self
                .inner
                .source
                .lock()
                .expect("lock poisoned")
                .take()
                .ok_or_else(|| {
                    Error::Transport(format!("memory adapter {} has no source", self.inner.name))
                })?;
            self.spawn_root_pump(source)
        };

        self.inner.tasks.lock().expect("lock poisoned").push(task);
        Ok(())
    }

    fn spawn_root_pump(&self, mut source: mpsc::UnboundedReceiver<Frame>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(frame) = source.recv().await {
                let publisher = {
                    let slot = inner.inbound_tx.lock().expect("lock poisoned");
                    slot.clone()
                };
                if let Some(tx) = publisher {
                    // No receivers is fine, taps come and go.
                    let _ = tx.send(frame.clone());
                }
                inner.upcalls.deliver_frame(frame);
            }
            // Peer dropped its sender: tear the fan-out down with us.
            inner.inbound_tx.lock().expect("lock poisoned").take();
            inner.upcalls.signal_close();
        })
    }

    fn spawn_tap_pump(&self, mut rx: broadcast::Receiver<Frame>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => inner.upcalls.deliver_frame(frame),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            adapter = %inner.name,
                            missed,
                            "Memory tap lagged, frames skipped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.upcalls.signal_close();
        })
    }

    /// Delivers one frame to the peer endpoint.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let tx = {
            let slot = self.inner.peer_tx.lock().expect("lock poisoned");
            slot.clone()
        };
        let tx = tx.ok_or_else(|| {
            Error::Transport(format!("memory adapter {} is closed", self.inner.name))
        })?;
        tx.send(frame).map_err(|_| {
            Error::Transport(format!(
                "memory peer of {} is gone, frame not delivered",
                self.inner.name
            ))
        })
    }

    /// Closes this endpoint. The peer observes EOF and closes as well; bound
    /// taps of a root endpoint are closed with it.
    pub async fn close(&self) {
        self.inner.peer_tx.lock().expect("lock poisoned").take();
        self.inner.inbound_tx.lock().expect("lock poisoned").take();
        let tasks: Vec<JoinHandle<()>> =
            self.inner.tasks.lock().expect("lock poisoned").drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.upcalls.signal_close();
    }

    /// Mints a tap sharing this root endpoint's write path and inbound
    /// stream. Fails on a bound adapter or a closed endpoint.
    pub fn bind(&self, name: impl Into<String>) -> Result<MemoryAdapter> {
        let subscription = {
            let slot = self.inner.inbound_tx.lock().expect("lock poisoned");
            slot.as_ref().map(|tx| tx.subscribe())
        };
        let subscription = subscription.ok_or_else(|| {
            Error::Transport(format!(
                "memory adapter {} cannot be bound (closed or already a tap)",
                self.inner.name
            ))
        })?;
        let peer_tx = self.inner.peer_tx.lock().expect("lock poisoned").clone();

        let name = name.into();
        Ok(MemoryAdapter {
            inner: Arc::new(MemoryInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                peer_tx: Mutex::new(peer_tx),
                source: Mutex::new(None),
                inbound_tx: Mutex::new(None),
                subscription: Mutex::new(Some(subscription)),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}
