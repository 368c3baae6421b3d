//! Client side of the streaming session: one WebSocket per PROCESSING episode.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::audio::{AudioChunk, AudioPlaybackEngine};
use crate::controller::ControlEvent;
use crate::error::{RejectReason, TransportError};
use crate::protocol::{ClientMessage, Request, ResponseUnit, SequenceGuard, UnitFrame, WireFrame};
use crate::session::{InterruptSignal, SessionId};

/// Consecutive undecodable units after which the stream is given up on.
const MAX_CONSECUTIVE_BAD_UNITS: usize = 8;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// UDP address of the server's out-of-band interrupt listener
    pub control_addr: String,
    pub total_timeout: Duration,
    pub unit_stale_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765/session".to_string(),
            control_addr: "127.0.0.1:8766".to_string(),
            total_timeout: Duration::from_secs(300),
            unit_stale_timeout: Duration::from_secs(15),
        }
    }
}

/// How a stream finished, as seen by the consumer.
#[derive(Debug)]
pub enum StreamOutcome {
    /// `End` received and playback drained.
    Completed(String),
    /// `Error` received from the server.
    ServerError(String),
    /// Closed without a terminator.
    Cancelled,
    /// `End` received but queued audio was still playing when the drain
    /// timeout ran out.
    Undrained,
    /// Stopped locally (signal set or handle cancelled).
    Interrupted,
    Failed(TransportError),
}

impl StreamOutcome {
    pub fn describe(&self) -> String {
        match self {
            StreamOutcome::Completed(m) => format!("completed: {}", m),
            StreamOutcome::ServerError(m) => format!("server error: {}", m),
            StreamOutcome::Cancelled => "closed without terminator".to_string(),
            StreamOutcome::Undrained => "playback did not drain".to_string(),
            StreamOutcome::Interrupted => "interrupted".to_string(),
            StreamOutcome::Failed(e) => e.to_string(),
        }
    }
}

/// Where consumed units go.
#[async_trait]
pub trait UnitSink: Send + Sync {
    async fn text(&self, session_id: SessionId, text: String);
    async fn audio(&self, session_id: SessionId, chunk: AudioChunk);
    /// Called on `End`, before the stream is reported complete. Returns
    /// whether everything delivered has finished playing.
    async fn finish(&self, session_id: SessionId) -> bool;
    fn ended(&self, session_id: SessionId, outcome: StreamOutcome);
}

/// Feeds audio into the playback engine and everything else back into the
/// controller's event loop.
pub struct ClientSink {
    engine: Arc<AudioPlaybackEngine>,
    events: mpsc::UnboundedSender<ControlEvent>,
    drain_timeout: Duration,
}

impl ClientSink {
    pub fn new(
        engine: Arc<AudioPlaybackEngine>,
        events: mpsc::UnboundedSender<ControlEvent>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            events,
            drain_timeout,
        }
    }
}

#[async_trait]
impl UnitSink for ClientSink {
    async fn text(&self, session_id: SessionId, text: String) {
        let _ = self.events.send(ControlEvent::Text { session_id, text });
    }

    // Waits for queue space, so a long reply holds the stream back instead
    // of losing its tail.
    async fn audio(&self, session_id: SessionId, chunk: AudioChunk) {
        if let Err(rejected) = self.engine.enqueue_wait(session_id, chunk).await {
            match rejected.reason {
                RejectReason::QueueFull => log::warn!("Session {}: {}", session_id, rejected),
                _ => log::debug!("Session {}: {}", session_id, rejected),
            }
        }
    }

    async fn finish(&self, session_id: SessionId) -> bool {
        let drained = self.engine.drain_or_timeout(self.drain_timeout).await;
        if !drained {
            log::warn!(
                "Session {}: playback did not drain within {:?}",
                session_id,
                self.drain_timeout
            );
        }
        drained
    }

    fn ended(&self, session_id: SessionId, outcome: StreamOutcome) {
        let _ = self.events.send(ControlEvent::StreamEnded { session_id, outcome });
    }
}

/// Reads response units until a terminator, a timeout, the signal or the
/// cancel token stops it. Malformed, foreign-session and out-of-order units
/// are dropped and the stream continues.
pub async fn consume<S>(
    frames: S,
    session_id: SessionId,
    signal: &InterruptSignal,
    cancel: &CancellationToken,
    sink: &dyn UnitSink,
    config: &ClientConfig,
) -> StreamOutcome
where
    S: Stream<Item = Result<WireFrame, TransportError>>,
{
    let mut frames = pin!(frames);
    let deadline = Instant::now() + config.total_timeout;
    let mut guard = SequenceGuard::default();
    let mut bad_units = 0usize;

    loop {
        if signal.check().is_err() {
            return StreamOutcome::Interrupted;
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Interrupted,
            _ = sleep_until(deadline) => {
                return StreamOutcome::Failed(TransportError::TotalTimeout(config.total_timeout));
            }
            next = timeout(config.unit_stale_timeout, frames.next()) => next,
        };
        let frame = match next {
            Err(_) => return StreamOutcome::Failed(TransportError::UnitStale(config.unit_stale_timeout)),
            Ok(None) => return StreamOutcome::Cancelled,
            Ok(Some(Err(e))) => return StreamOutcome::Failed(e),
            Ok(Some(Ok(frame))) => frame,
        };

        let unit = match UnitFrame::decode(&frame).and_then(|u| guard.admit(&u).map(|_| u)) {
            Ok(unit) => {
                bad_units = 0;
                unit
            }
            Err(e) => {
                bad_units += 1;
                log::warn!("Session {}: dropping unit: {}", session_id, e);
                if bad_units >= MAX_CONSECUTIVE_BAD_UNITS {
                    return StreamOutcome::Failed(TransportError::Unusable(bad_units));
                }
                continue;
            }
        };
        if unit.session_id != session_id {
            log::debug!("Dropping unit for stale session {}", unit.session_id);
            continue;
        }
        // The signal may have flipped while we were waiting on the network.
        if signal.check().is_err() {
            return StreamOutcome::Interrupted;
        }

        match unit.unit {
            ResponseUnit::Text(text) => sink.text(session_id, text).await,
            ResponseUnit::Audio(chunk) => sink.audio(session_id, chunk).await,
            ResponseUnit::End(message) => {
                let drained = sink.finish(session_id).await;
                if signal.is_set() || cancel.is_cancelled() {
                    return StreamOutcome::Interrupted;
                }
                if !drained {
                    return StreamOutcome::Undrained;
                }
                return StreamOutcome::Completed(message);
            }
            ResponseUnit::Error(message) => return StreamOutcome::ServerError(message),
        }
    }
}

/// Owner-side handle on a running consumer task.
#[derive(Debug)]
pub struct StreamHandle {
    pub session_id: SessionId,
    cancel: CancellationToken,
    // Detached on drop; the task ends through `cancel`.
    _task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn new(session_id: SessionId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            session_id,
            cancel,
            _task: task,
        }
    }

    /// Stop consuming. Does not wait for the task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// How the controller reaches a server. Both calls return immediately.
pub trait SessionTransport: Send + Sync {
    fn open(&self, request: Request, signal: InterruptSignal, sink: Arc<dyn UnitSink>) -> StreamHandle;
    fn notify_interrupt(&self, hardware_id: &str);
}

/// Fire-and-forget UDP interrupt notifications.
#[derive(Debug, Clone)]
pub struct InterruptNotifier {
    control_addr: String,
}

impl InterruptNotifier {
    pub fn new(control_addr: impl Into<String>) -> Self {
        Self {
            control_addr: control_addr.into(),
        }
    }

    pub fn notify(&self, hardware_id: &str) {
        let addr = self.control_addr.clone();
        let message = ClientMessage::Interrupt {
            hardware_id: hardware_id.to_string(),
        };
        tokio::spawn(async move {
            let result = async {
                let payload = message.encode()?;
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.send_to(payload.as_bytes(), &addr).await?;
                anyhow::Ok(())
            }
            .await;
            match result {
                Ok(()) => log::debug!("Interrupt notification sent to {}", addr),
                Err(e) => log::warn!("Interrupt notification to {} failed: {}", addr, e),
            }
        });
    }
}

pub struct WsTransport {
    config: ClientConfig,
    client_id: String,
    notifier: InterruptNotifier,
}

impl WsTransport {
    pub fn new(config: ClientConfig, client_id: impl Into<String>) -> Self {
        let notifier = InterruptNotifier::new(config.control_addr.clone());
        Self {
            config,
            client_id: client_id.into(),
            notifier,
        }
    }
}

impl SessionTransport for WsTransport {
    fn open(&self, request: Request, signal: InterruptSignal, sink: Arc<dyn UnitSink>) -> StreamHandle {
        let session_id = request.session_id;
        let cancel = CancellationToken::new();
        let config = self.config.clone();
        let client_id = self.client_id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = run_ws_session(&config, &client_id, request, &signal, &token, sink.as_ref()).await;
            log::info!("Session {} stream finished: {}", session_id, outcome.describe());
            sink.ended(session_id, outcome);
        });
        StreamHandle::new(session_id, cancel, task)
    }

    fn notify_interrupt(&self, hardware_id: &str) {
        self.notifier.notify(hardware_id);
    }
}

async fn run_ws_session(
    config: &ClientConfig,
    client_id: &str,
    request: Request,
    signal: &InterruptSignal,
    cancel: &CancellationToken,
    sink: &dyn UnitSink,
) -> StreamOutcome {
    let session_id = request.session_id;
    let hardware_id = request.hardware_id.clone();

    let connect = connect_and_send(config, client_id, request);
    let ws = tokio::select! {
        _ = cancel.cancelled() => return StreamOutcome::Interrupted,
        r = timeout(config.unit_stale_timeout, connect) => match r {
            Err(_) => return StreamOutcome::Failed(TransportError::Connect("connect timed out".into())),
            Ok(Err(e)) => return StreamOutcome::Failed(e),
            Ok(Ok(ws)) => ws,
        },
    };
    let (mut write, read) = ws.split();
    let frames = read.filter_map(|msg| async move { wire_frame(msg) });

    let outcome = consume(frames, session_id, signal, cancel, sink, config).await;
    if matches!(outcome, StreamOutcome::Interrupted) {
        // In-band copy of the out-of-band notification; the socket may already be gone.
        if let Ok(text) = (ClientMessage::Interrupt { hardware_id }).encode() {
            let _ = write.send(Message::Text(text.into())).await;
        }
    }
    let _ = write.send(Message::Close(None)).await;
    outcome
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_and_send(config: &ClientConfig, client_id: &str, request: Request) -> Result<WsStream, TransportError> {
    let url = Url::parse(&config.server_url).map_err(|e| TransportError::Connect(e.to_string()))?;
    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{}:{}", h, p),
        (Some(h), None) => h.to_string(),
        (None, _) => return Err(TransportError::Connect(format!("no host in {}", url))),
    };

    let ws_request = tokio_tungstenite::tungstenite::http::Request::builder()
        .method("GET")
        .uri(config.server_url.as_str())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        )
        .header("Device-Id", request.hardware_id.as_str())
        .header("Client-Id", client_id)
        .header("Protocol-Version", "1")
        .body(())
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    log::debug!("Connecting to {} for session {}", config.server_url, request.session_id);
    let (mut ws, _) = connect_async(ws_request)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let text = ClientMessage::Request(request)
        .encode()
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(ws)
}

/// Text/binary messages become frames; control messages are skipped and a
/// close frame is left to end the stream.
pub fn wire_frame(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<WireFrame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.to_string()))),
        Ok(Message::Binary(data)) => Some(Ok(WireFrame::Binary(data))),
        Ok(Message::Close(_)) => None,
        Ok(_) => None,
        Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
    }
}

/// The reverse of [`wire_frame`], used by the server to send units.
pub fn ws_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(data) => Message::Binary(data),
    }
}
