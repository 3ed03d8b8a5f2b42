//! Transport adapters for the bridge.
//!
//! A transport moves opaque JSON-RPC frames in both directions between two
//! endpoints. Three transports exist: stdio (child-process standard
//! streams), sse (a Server-Sent Events stream paired with a companion POST
//! endpoint) and memory (linked in-process channels). Every transport is
//! wrapped in an adapter exposing the same capability set: `start`, `send`,
//! `close`, and setters for the three upcalls (frame, error, close).
//!
//! The adapter set is closed, so it is modeled as a tagged union rather
//! than a trait object; new transports extend the [`Adapter`] enum.
//!
//! Server-rooted adapters (the ones a supervisor owns for a running server)
//! publish inbound frames on an internal broadcast channel. [`Adapter::bind`]
//! mints a dependent adapter that shares the write path and taps that
//! broadcast, which is how a single backend fans out to any number of client
//! connections without the connections overwriting each other's upcalls.

mod frame;
pub mod memory;
pub mod sse;
pub mod stdio;

use crate::error::{Error, Result};
pub use frame::Frame;
pub use memory::MemoryAdapter;
pub use sse::{SseAdapter, SseSink};
pub use stdio::{StdioAdapter, StdioPipes};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Buffered inbound frames tolerated before a frame handler is installed.
const PENDING_FRAME_LIMIT: usize = 256;

/// The transports a server or client can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child-process standard streams, newline-delimited JSON frames
    Stdio,
    /// SSE stream outbound, companion HTTP POST inbound
    Sse,
    /// Linked in-process channel pair
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// Upcall invoked for every inbound frame.
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;
/// Upcall invoked on transport I/O failure; close follows.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;
/// Upcall invoked exactly once when the adapter closes.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Shared upcall slots for one adapter.
///
/// Frames delivered before a frame handler is installed are buffered (up to
/// a bound) and flushed to the first handler, so a handler installed after
/// `start()` still sees the earliest frames. The close upcall fires at most
/// once over the adapter's lifetime, whichever of close-then-set or
/// set-then-close happens.
pub(crate) struct Upcalls {
    name: String,
    frame: Mutex<Option<FrameHandler>>,
    pending: Mutex<VecDeque<Frame>>,
    error: Mutex<Option<ErrorHandler>>,
    close: Mutex<Option<CloseHandler>>,
    closed: AtomicBool,
    close_delivered: AtomicBool,
}

impl Upcalls {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frame: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
            close: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_delivered: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_frame(&self, handler: FrameHandler) {
        let backlog: Vec<Frame> = {
            let mut slot = self.frame.lock().expect("upcall lock poisoned");
            *slot = Some(Arc::clone(&handler));
            let mut pending = self.pending.lock().expect("upcall lock poisoned");
            pending.drain(..).collect()
        };
        for frame in backlog {
            handler(frame);
        }
    }

    pub(crate) fn set_error(&self, handler: ErrorHandler) {
        *self.error.lock().expect("upcall lock poisoned") = Some(handler);
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        *self.close.lock().expect("upcall lock poisoned") = Some(Arc::clone(&handler));
        if self.closed.load(Ordering::SeqCst) && !self.close_delivered.swap(true, Ordering::SeqCst)
        {
            handler();
        }
    }

    pub(crate) fn deliver_frame(&self, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let handler = {
            let slot = self.frame.lock().expect("upcall lock poisoned");
            slot.clone()
        };
        match handler {
            Some(handler) => handler(frame),
            None => {
                let mut pending = self.pending.lock().expect("upcall lock poisoned");
                if pending.len() >= PENDING_FRAME_LIMIT {
                    tracing::warn!(
                        adapter = %self.name,
                        "Dropping oldest buffered frame, no frame handler installed"
                    );
                    pending.pop_front();
                }
                pending.push_back(frame);
            }
        }
    }

    pub(crate) fn deliver_error(&self, error: Error) {
        let handler = {
            let slot = self.error.lock().expect("upcall lock poisoned");
            slot.clone()
        };
        match handler {
            Some(handler) => handler(error),
            None => tracing::warn!(adapter = %self.name, error = %error, "Unhandled transport error"),
        }
    }

    /// Marks the adapter closed and fires the close upcall once.
    pub(crate) fn signal_close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = {
            let slot = self.close.lock().expect("upcall lock poisoned");
            slot.clone()
        };
        if let Some(handler) = handler {
            if !self.close_delivered.swap(true, Ordering::SeqCst) {
                handler();
            }
        }
    }

    /// Replaces every upcall with a no-op. A stopped handler detaches this
    /// way so the adapter can outlive it without holding references back.
    pub(crate) fn detach(&self) {
        *self.frame.lock().expect("upcall lock poisoned") = None;
        *self.error.lock().expect("upcall lock poisoned") = None;
        *self.close.lock().expect("upcall lock poisoned") = None;
        self.pending.lock().expect("upcall lock poisoned").clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Uniform interface over the three transports.
///
/// Cloning an `Adapter` clones a handle to the same underlying channel.
#[derive(Clone)]
pub enum Adapter {
    Stdio(StdioAdapter),
    Sse(SseAdapter),
    Memory(MemoryAdapter),
}

impl Adapter {
    pub fn kind(&self) -> TransportKind {
        match self {
            Adapter::Stdio(_) => TransportKind::Stdio,
            Adapter::Sse(_) => TransportKind::Sse,
            Adapter::Memory(_) => TransportKind::Memory,
        }
    }

    /// Establishes the underlying channel. Idempotent once started.
    pub async fn start(&self) -> Result<()> {
        match self {
            Adapter::Stdio(a) => a.start().await,
            Adapter::Sse(a) => a.start().await,
            Adapter::Memory(a) => a.start().await,
        }
    }

    /// Delivers one frame to the far side.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        match self {
            Adapter::Stdio(a) => a.send(frame).await,
            Adapter::Sse(a) => a.send(frame).await,
            Adapter::Memory(a) => a.send(frame).await,
        }
    }

    /// Releases resources and fires the close upcall (once).
    pub async fn close(&self) {
        match self {
            Adapter::Stdio(a) => a.close().await,
            Adapter::Sse(a) => a.close().await,
            Adapter::Memory(a) => a.close().await,
        }
    }

    /// Mints a dependent adapter that shares this adapter's write path and
    /// taps its inbound broadcast. Only server-rooted adapters can be bound.
    pub fn bind(&self, name: impl Into<String>) -> Result<Adapter> {
        match self {
            Adapter::Stdio(a) => Ok(Adapter::Stdio(a.bind(name)?)),
            Adapter::Sse(a) => Ok(Adapter::Sse(a.bind(name)?)),
            Adapter::Memory(a) => Ok(Adapter::Memory(a.bind(name)?)),
        }
    }

    pub fn set_frame_handler(&self, handler: FrameHandler) {
        self.upcalls().set_frame(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.upcalls().set_error(handler);
    }

    pub fn set_close_handler(&self, handler: CloseHandler) {
        self.upcalls().set_close(handler);
    }

    /// Replaces all three upcalls with no-ops.
    pub fn detach_handlers(&self) {
        self.upcalls().detach();
    }

    pub fn is_closed(&self) -> bool {
        self.upcalls().is_closed()
    }

    /// Feeds one inbound frame into the adapter from outside the transport,
    /// used by the POST companion endpoint of an SSE-served client.
    pub fn deliver_inbound(&self, frame: Frame) -> Result<()> {
        match self {
            Adapter::Sse(a) => a.deliver_inbound(frame),
            other => Err(Error::Transport(format!(
                "{} adapter does not accept injected inbound frames",
                other.kind()
            ))),
        }
    }

    fn upcalls(&self) -> &Upcalls {
        match self {
            Adapter::Stdio(a) => a.upcalls(),
            Adapter::Sse(a) => a.upcalls(),
            Adapter::Memory(a) => a.upcalls(),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}
