//! Connection management: port hunting, the shared HTTP/WebSocket port,
//! origin enforcement, and per-peer socket tasks.
//!
//! The bridge serves two things on one port: a plain `GET /` returning the
//! discovery document (how the CLI `cleanup` command finds live bridges
//! without upgrading), and WebSocket upgrades for peers. Incoming
//! connections are sniffed via `peek` so the upgrade bytes stay in the
//! stream for the handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bridge::peer::Peer;
use crate::bridge::{router, BridgeState};
use crate::protocol::CLOSE_ORIGIN_REJECTED;

/// How long to wait for enough bytes to classify a connection as HTTP or
/// WebSocket before giving up on it.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(2);

const SNIFF_BUF_LEN: usize = 4096;

/// Errors raised while standing the server up.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Every port in `[start, start + retries]` was taken.
    #[error("no free port in range {start}..={}", start.saturating_add(*retries))]
    PortsExhausted { start: u16, retries: u16 },
    /// A bind failed for a reason other than the address being in use.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    /// Listener or environment I/O failure.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind an HTTP listener, walking up from `port` past busy neighbours.
///
/// Tries `port`, then `port+1` up to `port+retries`; fails deterministically
/// once the budget is exhausted.
pub async fn bind_with_retries(port: u16, retries: u16) -> Result<TcpListener, ServerError> {
    for attempt in 0..=retries {
        let candidate = port.saturating_add(attempt);
        match TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => {
                if attempt > 0 {
                    info!(requested = port, bound = candidate, "port busy, walked up");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(port = candidate, "port in use, trying next");
            }
            Err(source) => {
                return Err(ServerError::Bind {
                    port: candidate,
                    source,
                })
            }
        }
    }
    Err(ServerError::PortsExhausted {
        start: port,
        retries,
    })
}

/// Accept connections until the task is aborted.
pub async fn accept_loop(state: Arc<BridgeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(state, stream, addr).await {
                        debug!(peer = %addr, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }
}

/// Queue a close frame on every live peer. Their read loops observe the
/// socket closing and run the normal disconnect sweep.
pub fn close_all_peers(state: &Arc<BridgeState>) {
    for peer in state.peers.all() {
        peer.send_message(Message::Close(None));
    }
}

async fn handle_connection(
    state: Arc<BridgeState>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let is_upgrade = tokio::time::timeout(SNIFF_TIMEOUT, sniff_websocket(&stream)).await??;
    if !is_upgrade {
        return serve_discovery(state, stream).await;
    }

    let mut origin: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            origin = req
                .headers()
                .get("origin")
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned);
            Ok(resp)
        },
    )
    .await?;

    let (mut ws_write, mut ws_read) = ws_stream.split();

    // Origin enforcement happens before any frame is processed.
    if let Some(origin) = origin.as_deref() {
        if !origin_allowed(origin) {
            warn!(peer = %addr, origin, "origin rejected");
            let _ = ws_write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Library(CLOSE_ORIGIN_REJECTED),
                    reason: "origin not allowed".into(),
                })))
                .await;
            return Ok(());
        }
        check_app_port(origin, state.config.server.app_port);
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let peer = Arc::new(Peer::new(addr.to_string(), origin, tx));
    state.peers.insert(Arc::clone(&peer));
    info!(peer = %addr, clients = state.peers.len(), "peer connected");

    // Write pump: everything addressed to this peer funnels through one
    // sender so handlers never hold the sink across an await.
    let pump = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if ws_write.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    while let Some(message) = ws_read.next().await {
        match message {
            Ok(Message::Text(text)) => router::dispatch(&state, &peer, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong ignored; the protocol is text-only
            Err(e) => {
                debug!(peer = %addr, error = %e, "read error");
                break;
            }
        }
    }

    pump.abort();
    state.peers.remove(peer.id());
    state.registry.sweep_peer(peer.id());
    state.clear_reply_targets_for(peer.id());
    info!(peer = %addr, clients = state.peers.len(), "peer disconnected");
    Ok(())
}

/// Peek at the request head without consuming it and decide whether this is
/// a WebSocket upgrade or a plain HTTP request.
async fn sniff_websocket(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = [0u8; SNIFF_BUF_LEN];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        if head.contains("upgrade: websocket") {
            return Ok(true);
        }
        // A complete header block without the upgrade header is plain HTTP.
        if head.contains("\r\n\r\n") || n == SNIFF_BUF_LEN {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serve the discovery document to a plain HTTP client and close.
async fn serve_discovery(state: Arc<BridgeState>, mut stream: TcpStream) -> anyhow::Result<()> {
    // Consume the request head before answering; closing a socket with
    // unread data resets it and can discard the response in flight.
    let mut buf = [0u8; SNIFF_BUF_LEN];
    let mut head: Vec<u8> = Vec::new();
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() >= SNIFF_BUF_LEN {
            break;
        }
    }

    let body = discovery_document(&state).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: http://localhost\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// The JSON document served on `GET /`.
pub fn discovery_document(state: &BridgeState) -> serde_json::Value {
    serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "port": state.port,
        "appPort": state.config.server.app_port,
        "connectedClients": state.peers.len(),
        "uptime": state.uptime_secs(),
    })
}

/// Only localhost origins may upgrade.
fn origin_allowed(origin: &str) -> bool {
    origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
}

/// An accepted origin on an unexpected app port is logged but tolerated.
fn check_app_port(origin: &str, app_port: u16) {
    let Ok(parsed) = url::Url::parse(origin) else {
        return;
    };
    if let Some(port) = parsed.port() {
        if port != app_port {
            warn!(origin, expected = app_port, "origin port differs from configured app port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_allowed() {
        assert!(origin_allowed("http://localhost:3000"));
        assert!(origin_allowed("http://127.0.0.1:5173"));
        assert!(!origin_allowed("http://evil.example"));
        assert!(!origin_allowed("https://localhost:3000"));
        assert!(!origin_allowed("http://localhost.evil.example:3000"));
    }

    #[tokio::test]
    async fn test_bind_walks_past_busy_port() {
        let occupied = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let busy_port = occupied.local_addr().expect("addr").port();

        let listener = bind_with_retries(busy_port, 10).await.expect("walk up");
        let bound = listener.local_addr().expect("addr").port();
        assert_ne!(bound, busy_port);
        assert!(bound > busy_port);
        assert!(u32::from(bound) <= u32::from(busy_port).saturating_add(10));
    }

    #[tokio::test]
    async fn test_bind_fails_deterministically_when_exhausted() {
        let occupied = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let busy_port = occupied.local_addr().expect("addr").port();

        let result = bind_with_retries(busy_port, 0).await;
        assert!(matches!(
            result,
            Err(ServerError::PortsExhausted { start, retries: 0 }) if start == busy_port
        ));
    }
}
