//! Server discovery, the verification handshake, and reconnection.
//!
//! The devbar dials `app_port + 6223` first and walks up through the scan
//! range until a bridge answers `server-info` for its app port. A bridge
//! that stays silent for a second is accepted anyway (older bridges never
//! sent `server-info`). Sessions that drop after connecting are retried
//! with exponential backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::PORT_OFFSET;
use crate::devbar::console::ConsoleRing;
use crate::devbar::handlers::{CommandHandlers, RPC_DEFAULT_QUALITY, RPC_DEFAULT_SCALE};
use crate::devbar::page::{CaptureOptions, ImageFormat, PageDriver};
use crate::protocol::{self, msg, Frame, CLOSE_ORIGIN_REJECTED};

/// Ports scanned past the base before the search restarts.
pub const PORT_SCAN_RANGE: u16 = 10;

/// How long to wait for `server-info` before accepting for backward
/// compatibility.
pub const SERVER_INFO_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause before restarting an exhausted port scan from the base port.
pub const PORT_SEARCH_FAIL_RETRY: Duration = Duration::from_secs(3);

/// Pause after an origin rejection (close 4001) before the next port.
const ORIGIN_REJECT_RETRY: Duration = Duration::from_millis(100);

/// Pause after a pre-handshake drop before rescanning from the base port.
const DROP_RETRY: Duration = Duration::from_secs(2);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle, observable by the devbar UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the given port.
    Connecting(u16),
    /// Socket open; waiting for the bridge to identify itself.
    AwaitingServerInfo(u16),
    /// Verified (or backward-compat accepted); commands are served.
    Connected,
    /// Destroyed, or the reconnect budget ran out.
    Closed,
}

enum SessionEnd {
    /// The bridge serves a different app; try the next port.
    WrongServer,
    /// Closed with 4001 before any frame: not our origin.
    OriginRejected,
    Dropped {
        was_connected: bool,
    },
}

enum Handshake {
    Info(Value),
    Closed(Option<u16>),
    Dropped,
}

struct Shared {
    app_port: u16,
    driver: Arc<dyn PageDriver>,
    handlers: CommandHandlers,
    console: Arc<ConsoleRing>,
    state: Mutex<ConnectionState>,
    /// Sender into the live session's write pump, when connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = next;
    }

    fn outbound_sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        outbound.clone()
    }
}

/// The page-side bridge connection.
pub struct DevbarBridge {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl DevbarBridge {
    /// Start dialing from `app_port + 6223` and keep the connection alive in
    /// a background task.
    #[must_use]
    pub fn connect(app_port: u16, driver: Arc<dyn PageDriver>, production: bool) -> Self {
        let console = Arc::new(ConsoleRing::new());
        Self::connect_with_console(app_port, driver, production, console)
    }

    /// Like [`DevbarBridge::connect`] with a caller-owned capture ring.
    #[must_use]
    pub fn connect_with_console(
        app_port: u16,
        driver: Arc<dyn PageDriver>,
        production: bool,
        console: Arc<ConsoleRing>,
    ) -> Self {
        let base_port = app_port.saturating_add(PORT_OFFSET);
        let shared = Arc::new(Shared {
            app_port,
            driver: Arc::clone(&driver),
            handlers: CommandHandlers::new(driver, Arc::clone(&console), production),
            console,
            state: Mutex::new(ConnectionState::Connecting(base_port)),
            outbound: Mutex::new(None),
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        Self { shared, task }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        *state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The console capture ring this connection serves `get-logs` from.
    #[must_use]
    pub fn console(&self) -> Arc<ConsoleRing> {
        Arc::clone(&self.shared.console)
    }

    /// Hot-module-reload hook: capture a scaled screenshot and push it to
    /// the bridge. Returns `false` when not connected or capture fails.
    pub async fn notify_hmr(&self, trigger: &str, changed_file: &str) -> bool {
        let Some(tx) = self.shared.outbound_sender() else {
            return false;
        };
        let options = CaptureOptions {
            full_page: false,
            selector: None,
            format: ImageFormat::Jpeg,
            quality: RPC_DEFAULT_QUALITY,
            scale: RPC_DEFAULT_SCALE,
        };
        let capture = match self.shared.driver.capture(&options).await {
            Ok(capture) => capture,
            Err(e) => {
                warn!(error = %e, "hmr capture failed");
                return false;
            }
        };
        let frame = json!({
            "type": msg::HMR_SCREENSHOT,
            "data": {
                "screenshot": capture.data_url,
                "trigger": trigger,
                "changedFile": changed_file,
                "timestamp": protocol::now_ms(),
            },
        });
        tx.send(Message::Text(frame.to_string())).is_ok()
    }

    /// Tear the connection down: stop the background task, drop the socket,
    /// empty the capture ring. No handler or timer runs afterwards.
    pub fn destroy(self) {
        self.task.abort();
        {
            let mut outbound = self
                .shared
                .outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *outbound = None;
        }
        self.shared.console.clear();
        self.shared.set_state(ConnectionState::Closed);
    }
}

async fn run(shared: Arc<Shared>) {
    let base_port = shared.app_port.saturating_add(PORT_OFFSET);
    let mut port = base_port;
    let mut scanned: u16 = 0;
    let mut reconnect_attempts: u32 = 0;
    let mut ever_connected = false;

    loop {
        shared.set_state(ConnectionState::Connecting(port));
        let url = format!("ws://127.0.0.1:{port}");

        let session = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => serve_session(&shared, ws, port).await,
            Err(e) => {
                debug!(port, error = %e, "dial failed");
                SessionEnd::WrongServer
            }
        };

        match session {
            SessionEnd::WrongServer => {
                scanned = scanned.saturating_add(1);
                if scanned > PORT_SCAN_RANGE {
                    debug!("port scan exhausted, retrying from base");
                    tokio::time::sleep(PORT_SEARCH_FAIL_RETRY).await;
                    port = base_port;
                    scanned = 0;
                } else {
                    port = port.saturating_add(1);
                }
            }
            SessionEnd::OriginRejected => {
                tokio::time::sleep(ORIGIN_REJECT_RETRY).await;
                scanned = scanned.saturating_add(1);
                if scanned > PORT_SCAN_RANGE {
                    tokio::time::sleep(PORT_SEARCH_FAIL_RETRY).await;
                    port = base_port;
                    scanned = 0;
                } else {
                    port = port.saturating_add(1);
                }
            }
            SessionEnd::Dropped { was_connected } => {
                if was_connected {
                    // A fresh disconnect restarts the backoff schedule.
                    ever_connected = true;
                    reconnect_attempts = 0;
                }
                reconnect_attempts = reconnect_attempts.saturating_add(1);
                if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
                    warn!("reconnect budget exhausted, giving up");
                    shared.set_state(ConnectionState::Closed);
                    return;
                }
                let delay = if ever_connected {
                    backoff_delay(reconnect_attempts)
                } else {
                    DROP_RETRY
                };
                debug!(attempt = reconnect_attempts, ?delay, "reconnecting");
                tokio::time::sleep(delay).await;
                port = base_port;
                scanned = 0;
            }
        }
    }
}

async fn serve_session(shared: &Arc<Shared>, ws: WsStream, port: u16) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let ready = json!({
        "type": msg::BROWSER_CLIENT_READY,
        "timestamp": protocol::now_ms(),
    });
    if write.send(Message::Text(ready.to_string())).await.is_err() {
        return SessionEnd::Dropped {
            was_connected: false,
        };
    }
    shared.set_state(ConnectionState::AwaitingServerInfo(port));

    let handshake = tokio::time::timeout(SERVER_INFO_TIMEOUT, async {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Ok(frame) = Frame::parse(&text) {
                        if frame.msg_type() == Some(msg::SERVER_INFO) {
                            return Handshake::Info(frame.value().clone());
                        }
                    }
                    // Commands before verification are not accepted.
                }
                Ok(Message::Close(frame)) => {
                    return Handshake::Closed(frame.map(|f| f.code.into()));
                }
                Ok(_) => {}
                Err(_) => return Handshake::Dropped,
            }
        }
        Handshake::Dropped
    })
    .await;

    match handshake {
        // Silence from the bridge: an older build that never sends
        // server-info. Accept the connection.
        Err(_elapsed) => {
            debug!(port, "no server-info within budget, accepting for compatibility");
        }
        Ok(Handshake::Info(info)) => {
            if !server_info_matches(&info, shared.app_port) {
                debug!(port, "bridge serves a different app");
                return SessionEnd::WrongServer;
            }
        }
        Ok(Handshake::Closed(Some(code))) if code == CLOSE_ORIGIN_REJECTED => {
            return SessionEnd::OriginRejected;
        }
        Ok(Handshake::Closed(_)) | Ok(Handshake::Dropped) => {
            return SessionEnd::Dropped {
                was_connected: false,
            };
        }
    }

    shared.set_state(ConnectionState::Connected);
    info!(port, "devbar connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut outbound = shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        *outbound = Some(tx.clone());
    }
    let pump = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write.send(message).await.is_err() {
                break;
            }
        }
    });

    let end = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                Ok(frame) => {
                    if let Some(reply) = shared.handlers.handle(&frame).await {
                        let _ = tx.send(Message::Text(reply.to_string()));
                    }
                }
                Err(e) => debug!(error = %e, "unparseable frame from bridge"),
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                break SessionEnd::Dropped {
                    was_connected: true,
                };
            }
            Some(Ok(_)) => {}
        }
    };

    pump.abort();
    {
        let mut outbound = shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        *outbound = None;
    }
    end
}

/// A bridge is ours when it reports no app port at all or exactly ours.
fn server_info_matches(info: &Value, app_port: u16) -> bool {
    match info.get("appPort") {
        None | Some(Value::Null) => true,
        Some(value) => value.as_u64() == Some(u64::from(app_port)),
    }
}

/// Exponential backoff: 1 s, 2 s, 4 s, ... capped at 30 s.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5);
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_server_info_matching() {
        assert!(server_info_matches(&json!({"appPort": 3000}), 3000));
        assert!(server_info_matches(&json!({"appPort": null}), 3000));
        assert!(server_info_matches(&json!({}), 3000));
        assert!(!server_info_matches(&json!({"appPort": 4000}), 3000));
    }
}
