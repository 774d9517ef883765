//! Peer bookkeeping: one entry per open WebSocket connection.
//!
//! A peer is classified `cli` on upgrade and promoted to `browser` on its
//! first `browser-client-ready` frame. Promotion happens at most once. The
//! bridge prefers the earliest promoted browser peer for command forwarding;
//! later browser peers still receive channel broadcasts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Stable peer identifier: the remote `address:port`.
pub type PeerId = String;

/// Peer classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// A driving peer (command-line tool). The initial classification.
    Cli,
    /// The driven page runtime, promoted on `browser-client-ready`.
    Browser,
}

/// One connected WebSocket peer.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    origin: Option<String>,
    browser: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

impl Peer {
    /// Create a peer in the initial `cli` classification.
    #[must_use]
    pub fn new(id: PeerId, origin: Option<String>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            origin,
            browser: AtomicBool::new(false),
            tx,
        }
    }

    /// The remote `address:port` this peer connected from.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `Origin` header presented at upgrade, if any.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Current classification.
    #[must_use]
    pub fn kind(&self) -> PeerKind {
        if self.browser.load(Ordering::Acquire) {
            PeerKind::Browser
        } else {
            PeerKind::Cli
        }
    }

    /// Whether this peer has been promoted to `browser`.
    #[must_use]
    pub fn is_browser(&self) -> bool {
        self.browser.load(Ordering::Acquire)
    }

    /// Promote to `browser`. Returns `true` only on the first promotion.
    pub fn promote(&self) -> bool {
        let was = self.browser.swap(true, Ordering::AcqRel);
        if !was {
            debug!(peer = %self.id, "peer promoted to browser");
        }
        !was
    }

    /// Queue a text frame for this peer's write pump.
    ///
    /// Returns `false` when the pump has shut down (the socket is closing);
    /// callers treat that as a dead subscriber and elide the peer.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Message::Text(text)).is_ok()
    }

    /// Queue a raw WebSocket message (close frames, pongs).
    pub fn send_message(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Whether the write pump is still accepting frames.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// The live peer table, keyed by remote `address:port`.
#[derive(Debug, Default)]
pub struct PeerMap {
    peers: Mutex<HashMap<PeerId, std::sync::Arc<Peer>>>,
    /// Promotion order of browser peers; the head is preferred for forwards.
    browser_order: Mutex<Vec<PeerId>>,
}

impl PeerMap {
    pub fn insert(&self, peer: std::sync::Arc<Peer>) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.id().to_owned(), peer);
    }

    /// Remove a peer and drop it from the browser preference order.
    pub fn remove(&self, id: &str) -> Option<std::sync::Arc<Peer>> {
        let removed = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers.remove(id)
        };
        let mut order = self.browser_order.lock().unwrap_or_else(|e| e.into_inner());
        order.retain(|p| p != id);
        removed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<std::sync::Arc<Peer>> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.get(id).cloned()
    }

    /// Number of live peers, for the discovery document.
    #[must_use]
    pub fn len(&self) -> usize {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live peer.
    #[must_use]
    pub fn all(&self) -> Vec<std::sync::Arc<Peer>> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Record a newly promoted browser peer at the back of the preference
    /// order.
    pub fn record_browser(&self, id: &str) {
        let mut order = self.browser_order.lock().unwrap_or_else(|e| e.into_inner());
        if !order.iter().any(|p| p == id) {
            order.push(id.to_owned());
        }
    }

    /// The preferred browser peer: the earliest promoted one that is still
    /// connected and open.
    #[must_use]
    pub fn preferred_browser(&self) -> Option<std::sync::Arc<Peer>> {
        let order = {
            let order = self.browser_order.lock().unwrap_or_else(|e| e.into_inner());
            order.clone()
        };
        for id in order {
            if let Some(peer) = self.get(&id) {
                if peer.is_open() {
                    return Some(peer);
                }
            }
        }
        None
    }
}
