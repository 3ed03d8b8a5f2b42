//! SSE transport: an event stream for one direction, a companion HTTP POST
//! endpoint for the other.
//!
//! Two shapes share this module. A *served* adapter attaches to an SSE
//! response the admin surface holds open towards a web client: outbound
//! frames become `data:` events on that response, inbound frames arrive via
//! the companion POST endpoint and are injected with
//! [`SseAdapter::deliver_inbound`]. A *dialing* adapter is the mirror image:
//! it consumes a remote server's SSE stream and POSTs outbound frames to the
//! companion endpoint the server advertises.

use crate::error::{Error, Result};
use crate::transport::{Frame, Upcalls};

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const FANOUT_CAPACITY: usize = 256;
/// Dial attempts before a stream connect is declared failed.
const DIAL_ATTEMPTS: usize = 5;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Event name used for frame payloads on the wire.
const MESSAGE_EVENT: &str = "message";
/// Event advertising the companion POST endpoint to the consumer.
const ENDPOINT_EVENT: &str = "endpoint";

/// Write half of a served SSE response.
///
/// The admin surface creates the channel, hands the sink to the adapter and
/// streams the receiver out as the HTTP response body. Dropping the receiver
/// (client disconnect) makes the next send fail, which closes the adapter.
#[derive(Clone)]
pub struct SseSink {
    tx: mpsc::Sender<String>,
}

impl SseSink {
    /// Creates a sink and the chunk receiver backing the streamed response.
    pub fn channel(capacity: usize) -> (SseSink, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SseSink { tx }, rx)
    }

    async fn send(&self, chunk: String) -> Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| Error::Transport("SSE client went away".to_string()))
    }
}

/// Formats one SSE event per the wire spec, data split across lines.
pub fn format_event(event: &str, data: &str) -> String {
    let mut out = String::new();
    if !event.is_empty() {
        out.push_str(&format!("event: {}\n", event));
    }
    for line in data.lines() {
        out.push_str(&format!("data: {}\n", line));
    }
    out.push('\n');
    out
}

enum SseOutbound {
    /// Served: write events into the held-open response.
    Sink {
        sink: Mutex<Option<SseSink>>,
        session_id: String,
        post_endpoint: String,
    },
    /// Dialing: POST frames to the advertised companion endpoint.
    Post {
        http: reqwest::Client,
        post_url: Mutex<reqwest::Url>,
    },
}

struct SseInner {
    name: String,
    outbound: Arc<SseOutbound>,
    stream_url: Option<reqwest::Url>,
    inbound_tx: Mutex<Option<tokio::sync::broadcast::Sender<Frame>>>,
    subscription: Mutex<Option<tokio::sync::broadcast::Receiver<Frame>>>,
    upcalls: Upcalls,
    is_root: bool,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Adapter over an SSE stream plus companion POST endpoint.
#[derive(Clone)]
pub struct SseAdapter {
    inner: Arc<SseInner>,
}

impl SseAdapter {
    /// Creates a served adapter over an open SSE response.
    ///
    /// `session_id` pairs the companion POST endpoint with this response;
    /// the connection id is used for it so the POST intake can find the
    /// right adapter again.
    pub fn serve(
        name: impl Into<String>,
        sink: SseSink,
        session_id: impl Into<String>,
        post_endpoint: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let (inbound_tx, _) = tokio::sync::broadcast::channel(FANOUT_CAPACITY);
        Self {
            inner: Arc::new(SseInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                outbound: Arc::new(SseOutbound::Sink {
                    sink: Mutex::new(Some(sink)),
                    session_id: session_id.into(),
                    post_endpoint: post_endpoint.into(),
                }),
                stream_url: None,
                inbound_tx: Mutex::new(Some(inbound_tx)),
                subscription: Mutex::new(None),
                is_root: true,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a dialing adapter towards a remote SSE endpoint.
    ///
    /// Until the server advertises its companion endpoint, outbound frames
    /// are POSTed to `{stream_url}/messages`.
    pub fn dial(name: impl Into<String>, stream_url: &str) -> Result<Self> {
        let name = name.into();
        let stream_url: reqwest::Url = stream_url
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("invalid SSE URL {}: {}", stream_url, e)))?;
        let post_url: reqwest::Url = format!("{}/messages", stream_url.as_str().trim_end_matches('/'))
            .parse()
            .map_err(|e| Error::ConfigInvalid(format!("invalid companion URL: {}", e)))?;

        let (inbound_tx, _) = tokio::sync::broadcast::channel(FANOUT_CAPACITY);
        Ok(Self {
            inner: Arc::new(SseInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                outbound: Arc::new(SseOutbound::Post {
                    http: reqwest::Client::new(),
                    post_url: Mutex::new(post_url),
                }),
                stream_url: Some(stream_url),
                inbound_tx: Mutex::new(Some(inbound_tx)),
                subscription: Mutex::new(None),
                is_root: true,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn upcalls(&self) -> &Upcalls {
        &self.inner.upcalls
    }

    /// Establishes the channel. For a served adapter this advertises the
    /// companion endpoint; for a dialing adapter it connects the stream
    /// (with a few retries, backends are often just coming up). Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.upcalls.is_closed() {
            return Err(Error::Transport(format!(
                "SSE adapter {} is closed",
                self.inner.name
            )));
        }

        match self.inner.outbound.as_ref() {
            SseOutbound::Sink {
                session_id,
                post_endpoint,
                ..
            } => {
                let advertised = format!("{}?sessionId={}", post_endpoint, session_id);
                self.send_chunk(format_event(ENDPOINT_EVENT, &advertised))
                    .await
            }
            SseOutbound::Post { http, .. } => {
                if !self.inner.is_root {
                    let rx = self
                        .inner
                        .subscription
                        .lock()
                        .expect("lock poisoned")
                        .take()
                        .ok_or_else(|| {
                            Error::Transport(format!(
                                "SSE adapter {} has no subscription",
                                self.inner.name
                            ))
                        })?;
                    let task = self.spawn_tap_pump(rx);
                    self.inner.tasks.lock().expect("lock poisoned").push(task);
                    return Ok(());
                }

                let stream_url = self.inner.stream_url.clone().ok_or_else(|| {
                    Error::Internal(format!(
                        "dialing adapter {} lost its stream URL",
                        self.inner.name
                    ))
                })?;
                let response = dial_stream(http, &stream_url).await?;
                let task = self.spawn_stream_reader(response);
                self.inner.tasks.lock().expect("lock poisoned").push(task);
                Ok(())
            }
        }
    }

    fn spawn_stream_reader(&self, response: reqwest::Response) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();
            let mut event_name = String::new();
            let mut data_lines: Vec<String> = Vec::new();

            'outer: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        inner
                            .upcalls
                            .deliver_error(Error::Transport(format!("SSE stream failed: {}", e)));
                        break 'outer;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);

                    if line.is_empty() {
                        if !data_lines.is_empty() {
                            dispatch_event(&inner, &event_name, &data_lines.join("\n"));
                        }
                        event_name.clear();
                        data_lines.clear();
                    } else if let Some(rest) = line.strip_prefix("event:") {
                        event_name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
                    }
                    // Comment lines (heartbeats) and unknown fields are skipped.
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
                            "SSE tap lagged, frames skipped"
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inner.upcalls.signal_close();
        })
    }

    /// Delivers one frame to the far side.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        match self.inner.outbound.as_ref() {
            SseOutbound::Sink { .. } => {
                let data = serde_json::to_string(frame.as_value())
                    .map_err(|e| Error::Serialization(format!("failed to serialize frame: {}", e)))?;
                self.send_chunk(format_event(MESSAGE_EVENT, &data)).await
            }
            SseOutbound::Post { http, post_url } => {
                let url = post_url.lock().expect("lock poisoned").clone();
                let response = http
                    .post(url)
                    .json(frame.as_value())
                    .send()
                    .await
                    .map_err(|e| Error::Transport(format!("POST failed: {}", e)))?;
                if !response.status().is_success() {
                    return Err(Error::Transport(format!(
                        "POST rejected with status {}",
                        response.status()
                    )));
                }
                Ok(())
            }
        }
    }

    async fn send_chunk(&self, chunk: String) -> Result<()> {
        let sink = match self.inner.outbound.as_ref() {
            SseOutbound::Sink { sink, .. } => sink.lock().expect("lock poisoned").clone(),
            SseOutbound::Post { .. } => None,
        };
        let sink = sink.ok_or_else(|| {
            Error::Transport(format!("SSE adapter {} is closed", self.inner.name))
        })?;
        match sink.send(chunk).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The attached client is gone; error, then close exactly once.
                self.inner
                    .upcalls
                    .deliver_error(Error::Transport(format!("SSE send failed: {}", e)));
                self.close().await;
                Err(e)
            }
        }
    }

    /// Injects one inbound frame received on the companion POST endpoint.
    pub fn deliver_inbound(&self, frame: Frame) -> Result<()> {
        if self.inner.upcalls.is_closed() {
            return Err(Error::Transport(format!(
                "SSE adapter {} is closed",
                self.inner.name
            )));
        }
        self.inner.upcalls.deliver_frame(frame);
        Ok(())
    }

    /// Closes the adapter and fires the close upcall once.
    pub async fn close(&self) {
        if self.inner.is_root {
            if let SseOutbound::Sink { sink, .. } = self.inner.outbound.as_ref() {
                sink.lock().expect("lock poisoned").take();
            }
            self.inner.inbound_tx.lock().expect("lock poisoned").take();
        }
        let tasks: Vec<JoinHandle<()>> =
            self.inner.tasks.lock().expect("lock poisoned").drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.upcalls.signal_close();
    }

    /// Mints a tap over a dialing root: shared POST path, broadcast stream.
    pub fn bind(&self, name: impl Into<String>) -> Result<SseAdapter> {
        if matches!(self.inner.outbound.as_ref(), SseOutbound::Sink { .. }) {
            return Err(Error::Transport(
                "served SSE adapters cannot be bound".to_string(),
            ));
        }
        let subscription = {
            let slot = self.inner.inbound_tx.lock().expect("lock poisoned");
            slot.as_ref().map(|tx| tx.subscribe())
        };
        let subscription = subscription.ok_or_else(|| {
            Error::Transport(format!(
                "SSE adapter {} cannot be bound (closed or already a tap)",
                self.inner.name
            ))
        })?;

        let name = name.into();
        Ok(SseAdapter {
            inner: Arc::new(SseInner {
                upcalls: Upcalls::new(name.clone()),
                name,
                outbound: Arc::clone(&self.inner.outbound),
                stream_url: None,
                inbound_tx: Mutex::new(None),
                subscription: Mutex::new(Some(subscription)),
                is_root: false,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

async fn dial_stream(http: &reqwest::Client, url: &reqwest::Url) -> Result<reqwest::Response> {
    let mut last_err = None;
    for attempt in 1..=DIAL_ATTEMPTS {
        match http
            .get(url.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                last_err = Some(Error::Transport(format!(
                    "SSE endpoint returned status {}",
                    response.status()
                )));
            }
            Err(e) => {
                last_err = Some(Error::Transport(format!("SSE connect failed: {}", e)));
            }
        }
        if attempt < DIAL_ATTEMPTS {
            tokio::time::sleep(DIAL_RETRY_DELAY).await;
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Transport("SSE connect failed".to_string())))
}

fn dispatch_event(inner: &Arc<SseInner>, event: &str, data: &str) {
    match event {
        ENDPOINT_EVENT => {
            let resolved = inner
                .stream_url
                .as_ref()
                .and_then(|base| base.join(data).ok())
                .or_else(|| data.parse().ok());
            match (resolved, inner.outbound.as_ref()) {
                (Some(url), SseOutbound::Post { post_url, .. }) => {
                    tracing::debug!(adapter = %inner.name, endpoint = %url, "Companion endpoint advertised");
                    *post_url.lock().expect("lock poisoned") = url;
                }
                _ => {
                    tracing::warn!(adapter = %inner.name, data = %data, "Unusable endpoint event");
                }
            }
        }
        "" | MESSAGE_EVENT => match Frame::from_line(data) {
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
                tracing::warn!(adapter = %inner.name, error = %e, "Skipping unparseable SSE data event");
            }
        },
        other => {
            tracing::trace!(adapter = %inner.name, event = %other, "Ignoring SSE event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_event_single_line() {
        let out = format_event("message", r#"{"jsonrpc":"2.0"}"#);
        assert_eq!(out, "event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
    }

    #[test]
    fn test_format_event_multiline_data() {
        let out = format_event("message", "a\nb");
        assert_eq!(out, "event: message\ndata: a\ndata: b\n\n");
    }
}
