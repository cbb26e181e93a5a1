//! Transport seam between the session and the realtime model.
//!
//! The orchestrator only ever sees a [`FrameSink`] for outbound text frames
//! and a stream of [`TransportEvent`]s for everything inbound. The
//! WebSocket client here is the native transport; tests and embedders can
//! plug in [`MemorySink`] or their own sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{GateError, Result};

/// Capacity of the inbound event queue per connection.
const INBOUND_CAPACITY: usize = 256;

/// Outbound half of a transport. Owned by the session while it is alive and
/// handed back for release on teardown.
pub trait FrameSink: Send {
    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Transport`] if the connection is gone.
    fn send_text(&mut self, frame: String) -> Result<()>;

    /// Release the transport. Consumes the sink so it cannot be reused.
    fn close(self: Box<Self>);
}

/// Inbound notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open and accepts frames.
    Open,
    /// One inbound text frame.
    Frame(String),
    /// The channel is gone; no further events follow.
    Closed { reason: String },
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Sink that records frames in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames written so far, in order.
    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        match self.frames.lock() {
            Ok(f) => f.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Frames decoded as JSON, skipping any that fail to parse.
    #[must_use]
    pub fn json_frames(&self) -> Vec<serde_json::Value> {
        self.frames()
            .iter()
            .filter_map(|f| serde_json::from_str(f).ok())
            .collect()
    }

    /// Frames whose `type` equals `kind`.
    #[must_use]
    pub fn frames_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.json_frames()
            .into_iter()
            .filter(|v| v.get("type").and_then(serde_json::Value::as_str) == Some(kind))
            .collect()
    }

    /// Whether [`FrameSink::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self.closed.lock() {
            Ok(c) => *c,
            Err(p) => *p.into_inner(),
        }
    }
}

impl FrameSink for MemorySink {
    fn send_text(&mut self, frame: String) -> Result<()> {
        if self.is_closed() {
            return Err(GateError::Transport("sink closed".into()));
        }
        match self.frames.lock() {
            Ok(mut f) => f.push(frame),
            Err(p) => p.into_inner().push(frame),
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        match self.closed.lock() {
            Ok(mut c) => *c = true,
            Err(p) => *p.into_inner() = true,
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

enum WsCommand {
    Send(String),
    Close,
}

/// Outbound half of a WebSocket connection.
pub struct WsSink {
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl FrameSink for WsSink {
    fn send_text(&mut self, frame: String) -> Result<()> {
        self.tx
            .send(WsCommand::Send(frame))
            .map_err(|_| GateError::Transport("websocket task has exited".into()))
    }

    fn close(self: Box<Self>) {
        // The task may already be gone after a remote close.
        let _ = self.tx.send(WsCommand::Close);
    }
}

/// Background task driving one WebSocket connection.
pub struct SocketTask(JoinHandle<()>);

impl SocketTask {
    /// Wait up to `grace` for queued frames and the close handshake to go
    /// out. Returns `false` if the task was still running and got aborted.
    pub async fn finish(self, grace: Duration) -> bool {
        let mut handle = self.0;
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("websocket task failed: {e}");
                true
            }
            Err(_) => {
                warn!("websocket did not shut down within {grace:?}, aborting");
                handle.abort();
                false
            }
        }
    }
}

/// Build the realtime WebSocket URL (`{ws_url}?model={model}`).
///
/// # Errors
///
/// Returns [`GateError::Config`] if `ws_url` is not a valid URL.
pub fn realtime_url(config: &RealtimeConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.ws_url)
        .map_err(|e| GateError::Config(format!("invalid realtime.ws_url: {e}")))?;
    if !config.model.trim().is_empty() {
        url.query_pairs_mut().append_pair("model", config.model.trim());
    }
    Ok(url)
}

/// Open a WebSocket to the realtime model.
///
/// Returns immediately; the connection is established on a background task
/// which reports [`TransportEvent::Open`] once frames can be sent, then
/// forwards inbound text frames until it emits [`TransportEvent::Closed`].
/// Await the returned [`SocketTask`] after closing the sink so frames sent
/// during teardown reach the server.
///
/// # Errors
///
/// Returns an error if the request cannot be built (bad URL or credential).
pub fn connect_websocket(
    url: &url::Url,
    bearer: &str,
) -> Result<(WsSink, mpsc::Receiver<TransportEvent>, SocketTask)> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| GateError::Transport(format!("build request: {e}")))?;
    let auth = HeaderValue::from_str(&format!("Bearer {bearer}"))
        .map_err(|e| GateError::Config(format!("invalid realtime credential: {e}")))?;
    let headers = request.headers_mut();
    headers.insert("Authorization", auth);
    headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::channel(INBOUND_CAPACITY);

    let task = tokio::spawn(async move {
        let reason = match run_socket(request, cmd_rx, &event_tx).await {
            Ok(()) => "closed by client".to_owned(),
            Err(e) => e,
        };
        info!("realtime websocket closed: {reason}");
        let _ = event_tx.send(TransportEvent::Closed { reason }).await;
    });

    Ok((WsSink { tx: cmd_tx }, event_rx, SocketTask(task)))
}

/// Drive one WebSocket connection. `Ok(())` means the client asked to close.
async fn run_socket(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> std::result::Result<(), String> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut write, mut read) = ws_stream.split();

    if event_tx.send(TransportEvent::Open).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx.send(TransportEvent::Frame(text)).await.is_err() {
                            // Nobody is listening any more.
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let detail = frame
                            .map(|f| format!("{} {}", f.code, f.reason))
                            .unwrap_or_default();
                        return Err(format!("closed by server {detail}").trim().to_owned());
                    }
                    None => return Err("connection closed by server".into()),
                    Some(Err(e)) => return Err(format!("read error: {e}")),
                    Some(Ok(other)) => {
                        debug!("ignoring non-text websocket message ({} bytes)", other.len());
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Send(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            return Err(format!("send error: {e}"));
                        }
                    }
                    Some(WsCommand::Close) | None => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            warn!("websocket close handshake failed: {e}");
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}
