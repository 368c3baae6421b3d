//! Network front of the server: WebSocket sessions plus the UDP control port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::registry::InterruptRegistry;
use super::session::SessionServer;
use super::{ContextSource, ResponseGenerator, ServerConfig};
use crate::net_link::ws_message;
use crate::protocol::{ClientMessage, WireFrame};

/// How long a fresh connection may take to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Outgoing frames buffered per connection.
const OUTBOUND_DEPTH: usize = 32;

/// Bind both ports and serve until one of the loops fails.
pub async fn serve(
    config: ServerConfig,
    generator: Arc<dyn ResponseGenerator>,
    context: Arc<dyn ContextSource>,
) -> anyhow::Result<()> {
    let tcp = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let udp = UdpSocket::bind(("0.0.0.0", config.control_port))
        .await
        .with_context(|| format!("binding control port {}", config.control_port))?;
    log::info!(
        "Serving sessions on {}, interrupts on udp/{}",
        config.bind_addr,
        config.control_port
    );

    let registry = Arc::new(InterruptRegistry::new());
    let server = Arc::new(SessionServer::new(generator, context, config));

    tokio::select! {
        r = accept_loop(tcp, server, registry.clone()) => r,
        r = control_loop(udp, registry) => r,
    }
}

pub async fn accept_loop(
    listener: TcpListener,
    server: Arc<SessionServer>,
    registry: Arc<InterruptRegistry>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, server, registry).await {
                log::warn!("Connection {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Out-of-band `Interrupt{hardware_id}` datagrams.
pub async fn control_loop(socket: UdpSocket, registry: Arc<InterruptRegistry>) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            continue;
        };
        match ClientMessage::decode(text) {
            Ok(ClientMessage::Interrupt { hardware_id }) => {
                let hit = registry.interrupt(&hardware_id);
                log::info!(
                    "Out-of-band interrupt for {} from {} ({})",
                    hardware_id,
                    from,
                    if hit { "stopped session" } else { "nothing running" }
                );
            }
            Ok(ClientMessage::Request(_)) => {
                log::debug!("Ignoring request on control port from {}", from);
            }
            Err(e) => log::debug!("Bad control datagram from {}: {}", from, e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<SessionServer>,
    registry: Arc<InterruptRegistry>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let first = tokio::time::timeout(REQUEST_TIMEOUT, read.next())
        .await
        .map_err(|_| anyhow!("no request within {:?}", REQUEST_TIMEOUT))?
        .ok_or_else(|| anyhow!("closed before request"))??;
    let Message::Text(text) = first else {
        return Err(anyhow!("first frame was not a text request"));
    };
    let request = match ClientMessage::decode(&text)? {
        ClientMessage::Request(request) => request,
        ClientMessage::Interrupt { hardware_id } => {
            registry.interrupt(&hardware_id);
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }
    };

    let hardware_id = request.hardware_id.clone();
    let session_id = request.session_id;
    log::info!("Session {} from {} ({})", session_id, peer, hardware_id);
    let signal = registry.begin(&hardware_id);

    // Close, error, or an in-band interrupt all stop the session.
    let watcher = {
        let signal = signal.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(ClientMessage::Interrupt { .. }) = ClientMessage::decode(&text) {
                            log::info!("In-band interrupt for session {}", session_id);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            signal.set();
        })
    };

    let (tx, mut rx) = mpsc::channel::<WireFrame>(OUTBOUND_DEPTH);
    let writer = {
        let signal = signal.clone();
        async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write.send(ws_message(frame)).await {
                    log::debug!("Session {}: send failed: {}", session_id, e);
                    signal.set();
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        }
    };
    let producer = async move {
        let end = server.run_session(request, &signal, &tx).await;
        (end, signal)
    };

    let ((end, signal), ()) = tokio::join!(producer, writer);
    watcher.abort();
    registry.finish(&hardware_id, &signal);
    log::debug!("Session {} released ({:?})", session_id, end);
    Ok(())
}
