//! The frame-forwarding pair at the heart of every connection.
//!
//! A [`Handler`] joins one client-side adapter and one per-connection
//! server-side tap and moves frames between them, one forwarding task per
//! direction. Within a direction, frames leave in the order they arrived;
//! the two directions never block each other.
//!
//! The handler holds no policy. Close and error upcalls are reported as
//! [`BridgeEvent`]s to the manager, which decides between teardown and
//! reconnect; `stop()` detaches every upcall (so the adapters can outlive
//! the handler), closes this connection's server-side tap, and closes the
//! client adapter only when asked to.

use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::transport::{Adapter, Frame, TransportKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which side of a bridge went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client adapter closed; the server stays available.
    Client,
    /// The server side closed or failed; the connection cannot continue.
    Server,
}

/// Lifecycle notifications from handlers to the bridge manager.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ConnectionClosed {
        id: ConnectionId,
        reason: CloseReason,
    },
}

/// Whether the bridge supports this client/server transport pairing.
///
/// Same-transport pairs have nothing to bridge and are rejected, except
/// memory↔memory, which is the in-process loop.
pub fn supported_combination(client: TransportKind, server: TransportKind) -> bool {
    matches!(
        (client, server),
        (TransportKind::Stdio, TransportKind::Sse)
            | (TransportKind::Sse, TransportKind::Stdio)
            | (TransportKind::Memory, TransportKind::Memory)
    )
}

/// A live bidirectional bridge between one client and one server adapter.
pub struct Handler {
    id: ConnectionId,
    client: Adapter,
    server: Adapter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Handler {
    /// Pairs two adapters. Fails with UnsupportedTransport when the
    /// combination is not in the supported set.
    pub fn new(id: ConnectionId, client: Adapter, server: Adapter) -> Result<Self> {
        if !supported_combination(client.kind(), server.kind()) {
            return Err(Error::UnsupportedTransport(format!(
                "{} client against {} server",
                client.kind(),
                server.kind()
            )));
        }
        Ok(Self {
            id,
            client,
            server,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client(&self) -> &Adapter {
        &self.client
    }

    pub fn server(&self) -> &Adapter {
        &self.server
    }

    /// Installs the upcalls on both adapters, then starts the server side
    /// before the client side, so a client transport that opens a socket on
    /// start finds the backend already live.
    pub async fn start(&self, events: mpsc::UnboundedSender<BridgeEvent>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel::<Frame>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Frame>();

        {
            let tx = to_server_tx.clone();
            self.client.set_frame_handler(Arc::new(move |frame| {
                let _ = tx.send(frame);
            }));
        }
        {
            let tx = to_client_tx.clone();
            self.server.set_frame_handler(Arc::new(move |frame| {
                let _ = tx.send(frame);
            }));
        }

        let id = self.id;
        {
            let events = events.clone();
            self.server.set_close_handler(Arc::new(move || {
                let _ = events.send(BridgeEvent::ConnectionClosed {
                    id,
                    reason: CloseReason::Server,
                });
            }));
        }
        {
            let events = events.clone();
            self.client.set_close_handler(Arc::new(move || {
                let _ = events.send(BridgeEvent::ConnectionClosed {
                    id,
                    reason: CloseReason::Client,
                });
            }));
        }
        // Errors precede closes in the adapter contract; the close event is
        // what drives teardown, the error itself is only worth a log line.
        self.server.set_error_handler(Arc::new(move |e| {
            tracing::warn!(connection = %id, error = %e, "Server transport error");
        }));
        self.client.set_error_handler(Arc::new(move |e| {
            tracing::warn!(connection = %id, error = %e, "Client transport error");
        }));

        {
            let mut tasks = self.tasks.lock().expect("handler lock poisoned");
            tasks.push(spawn_forwarder(
                id,
                CloseReason::Server,
                to_server_rx,
                self.server.clone(),
                events.clone(),
            ));
            tasks.push(spawn_forwarder(
                id,
                CloseReason::Client,
                to_client_rx,
                self.client.clone(),
                events,
            ));
        }

        self.server.start().await?;
        self.client.start().await?;
        Ok(())
    }

    /// Detaches the upcalls, stops forwarding and closes this connection's
    /// server-side tap. The client adapter is closed only when
    /// `close_client` is set; a hot-swap keeps it open so the far side
    /// stays attached while the server underneath is replaced.
    pub async fn stop(&self, close_client: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            if !close_client {
                return;
            }
            // A second stop may still need to close a client kept open by
            // an earlier soft stop.
            self.client.close().await;
            return;
        }

        self.client.detach_handlers();
        self.server.detach_handlers();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("handler lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        self.server.close().await;
        if close_client {
            self.client.close().await;
        }
    }
}

/// One direction of the bridge: drain the queue fed by the near side's
/// frame upcall and send into the far adapter, preserving arrival order.
fn spawn_forwarder(
    id: ConnectionId,
    failure_side: CloseReason,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    destination: Adapter,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = destination.send(frame).await {
                tracing::warn!(
                    connection = %id,
                    destination = %destination.kind(),
                    error = %e,
                    "Frame forwarding failed"
                );
                let _ = events.send(BridgeEvent::ConnectionClosed {
                    id,
                    reason: failure_side,
                });
                break;
            }
        }
    })
}
