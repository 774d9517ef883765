//! The bridge server: peer classification, command routing, pub/sub fan-out,
//! and artifact persistence.
//!
//! All process-wide state lives behind a single [`Bridge`] value that can be
//! created, started, closed, and re-created in tests. The accept loop, the
//! per-peer read loops, and the pending-request timers all share one
//! [`BridgeState`].

pub mod peer;
pub mod registry;
pub mod review;
pub mod router;
pub mod server;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BridgeConfig;
use crate::persist::ArtifactStore;
use peer::{PeerId, PeerMap};
use registry::SubscriptionRegistry;
use review::DesignReviewer;
use server::ServerError;

/// Shared state behind every bridge task.
pub struct BridgeState {
    pub config: BridgeConfig,
    /// The WebSocket port actually bound (after port hunting).
    pub port: u16,
    pub started_at: Instant,
    pub peers: PeerMap,
    pub registry: SubscriptionRegistry,
    pub store: ArtifactStore,
    pub reviewer: Option<Arc<dyn DesignReviewer>>,
    /// Reply-target registration: browser peer id → CLI peer awaiting the
    /// next unmatched browser frame. Cleared after delivery and on
    /// disconnect of either side.
    reply_targets: Mutex<HashMap<PeerId, PeerId>>,
}

impl BridgeState {
    /// Register `cli` as the reply target for the next unmatched frame from
    /// `browser`.
    pub fn register_reply_target(&self, browser: &str, cli: &str) {
        let mut targets = self.reply_targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.insert(browser.to_owned(), cli.to_owned());
    }

    /// Take (and clear) the reply target registered for `browser`.
    #[must_use]
    pub fn take_reply_target(&self, browser: &str) -> Option<PeerId> {
        let mut targets = self.reply_targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.remove(browser)
    }

    /// Drop every registration involving `peer`, on either side.
    pub fn clear_reply_targets_for(&self, peer: &str) {
        let mut targets = self.reply_targets.lock().unwrap_or_else(|e| e.into_inner());
        targets.retain(|browser, cli| browser != peer && cli != peer);
    }

    /// Seconds since the bridge started, for the discovery document.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// A running bridge: the bound listener plus its accept task.
pub struct Bridge {
    state: Arc<BridgeState>,
    accept_task: JoinHandle<()>,
}

impl Bridge {
    /// Start a bridge with the given config, project root defaulting to the
    /// working directory and no design reviewer.
    pub async fn start(config: BridgeConfig) -> Result<Self, ServerError> {
        Self::builder(config).start().await
    }

    /// Start configuring a bridge.
    #[must_use]
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            project_root: None,
            reviewer: None,
        }
    }

    /// The WebSocket port the bridge bound.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.state.port
    }

    /// Shared state, for tests and the discovery endpoint.
    #[must_use]
    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    /// Shut down: close every peer socket, stop the accept loop, and release
    /// the port before resolving.
    pub async fn close(self) {
        server::close_all_peers(&self.state);
        self.accept_task.abort();
        let _ = self.accept_task.await;
        info!(port = self.state.port, "bridge closed");
    }
}

/// Build a state value without binding a socket, for handler-level tests.
#[cfg(test)]
pub(crate) fn test_state(
    root: &std::path::Path,
    reviewer: Option<Arc<dyn DesignReviewer>>,
) -> Arc<BridgeState> {
    let mut config = BridgeConfig::default();
    config.server.screenshot_timeout_ms = 5_000;
    Arc::new(BridgeState {
        config,
        port: 9223,
        started_at: Instant::now(),
        peers: PeerMap::default(),
        registry: SubscriptionRegistry::default(),
        store: ArtifactStore::new(root),
        reviewer,
        reply_targets: Mutex::new(HashMap::new()),
    })
}

/// Configures and starts a [`Bridge`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    project_root: Option<PathBuf>,
    reviewer: Option<Arc<dyn DesignReviewer>>,
}

impl BridgeBuilder {
    /// Persist artifacts beneath `root` instead of the working directory.
    #[must_use]
    pub fn project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }

    /// Attach a design-review collaborator.
    #[must_use]
    pub fn reviewer(mut self, reviewer: Arc<dyn DesignReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Hunt for a port, bind, and spawn the accept loop.
    pub async fn start(self) -> Result<Bridge, ServerError> {
        let root = match self.project_root {
            Some(root) => root,
            None => std::env::current_dir().map_err(ServerError::Io)?,
        };

        let requested = self.config.ws_port();
        let listener =
            server::bind_with_retries(requested, self.config.server.port_retries).await?;
        let port = listener.local_addr().map_err(ServerError::Io)?.port();

        let state = Arc::new(BridgeState {
            config: self.config,
            port,
            started_at: Instant::now(),
            peers: PeerMap::default(),
            registry: SubscriptionRegistry::default(),
            store: ArtifactStore::new(root),
            reviewer: self.reviewer,
            reply_targets: Mutex::new(HashMap::new()),
        });

        info!(
            port,
            app_port = state.config.server.app_port,
            root = %state.store.root().display(),
            "bridge listening"
        );

        let accept_task = tokio::spawn(server::accept_loop(Arc::clone(&state), listener));
        Ok(Bridge { state, accept_task })
    }
}
