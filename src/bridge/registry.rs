//! Subscription registry: pending screenshot RPCs, channel subscriptions,
//! and filtered log streams.
//!
//! All three tables are swept when a peer disconnects. Pending entries hold
//! the handle of their timeout task so that completion can cancel it; the
//! handle is dropped (never awaited) once aborted.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::peer::PeerId;
use crate::types::{ConsoleLogEntry, LogFilters};

/// Patterns are rejected outright past this length.
const MAX_PATTERN_LEN: usize = 200;

/// Catastrophic-backtracking shapes screened before compilation. A pattern
/// containing any of these never causes a delivery.
const BANNED_SHAPES: [&str; 4] = ["(.*)+", "(.+)+", "([^)]*+)+", r"([^)]*\*)+"];

/// A screenshot RPC awaiting its `screenshot-response`.
#[derive(Debug)]
pub struct PendingScreenshot {
    /// The CLI peer the eventual reply is addressed to.
    pub origin: PeerId,
    /// Timeout task; aborted when the reply arrives first.
    pub timeout: JoinHandle<()>,
}

/// A filtered log stream attached to one peer.
#[derive(Debug)]
pub struct LogSubscription {
    pub id: String,
    pub peer: PeerId,
    pub filters: LogFilters,
    /// Compiled once at subscribe time. `None` with a pattern present means
    /// the pattern failed the guard and the subscription never matches.
    regex: Option<Regex>,
    pattern_rejected: bool,
}

impl LogSubscription {
    /// Build a subscription, compiling the pattern behind the ReDoS guard.
    #[must_use]
    pub fn new(id: String, peer: PeerId, filters: LogFilters) -> Self {
        let (regex, pattern_rejected) = match filters.pattern.as_deref() {
            None => (None, false),
            Some(pattern) => match compile_guarded(pattern) {
                Some(re) => (Some(re), false),
                None => {
                    warn!(subscription = %id, "log filter pattern rejected; subscription will not match");
                    (None, true)
                }
            },
        };
        Self {
            id,
            peer,
            filters,
            regex,
            pattern_rejected,
        }
    }

    /// Pure filter evaluation: an entry is delivered iff every provided
    /// filter matches. Unspecified filters match anything.
    #[must_use]
    pub fn matches(&self, entry: &ConsoleLogEntry) -> bool {
        if self.pattern_rejected {
            return false;
        }
        if let Some(levels) = &self.filters.levels {
            if !levels.contains(&entry.level) {
                return false;
            }
        }
        if let Some(re) = &self.regex {
            if !re.is_match(&entry.message) {
                return false;
            }
        }
        if let Some(source) = &self.filters.source {
            if entry.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Guarded regex compilation: enforce the length cap and the banned-shape
/// screen before ever handing the pattern to the regex engine.
#[must_use]
pub fn compile_guarded(pattern: &str) -> Option<Regex> {
    if pattern.len() > MAX_PATTERN_LEN {
        warn!(len = pattern.len(), "log filter pattern over length cap");
        return None;
    }
    if BANNED_SHAPES.iter().any(|shape| pattern.contains(shape)) {
        warn!("log filter pattern matches a banned shape");
        return None;
    }
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(error = %e, "log filter pattern failed to compile");
            None
        }
    }
}

/// The three registry tables.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    pending: Mutex<HashMap<String, PendingScreenshot>>,
    channels: Mutex<HashMap<String, Vec<PeerId>>>,
    log_subs: Mutex<Vec<LogSubscription>>,
}

impl SubscriptionRegistry {
    // ── Pending screenshot requests ──

    /// Register a pending screenshot RPC. A reused `requestId` replaces the
    /// previous entry; the displaced timeout is cancelled.
    pub fn insert_pending(&self, request_id: String, entry: PendingScreenshot) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pending.insert(request_id.clone(), entry) {
            warn!(request_id = %request_id, "requestId reused while pending; replacing entry");
            old.timeout.abort();
        }
    }

    /// Remove and return the pending entry for `request_id`, if any.
    /// A late reply with an unknown id yields `None` and is dropped silently.
    #[must_use]
    pub fn take_pending(&self, request_id: &str) -> Option<PendingScreenshot> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(request_id)
    }

    // ── Channel subscriptions ──

    /// Add a peer to a channel's ordered subscriber list.
    pub fn subscribe(&self, channel: &str, peer: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let subscribers = channels.entry(channel.to_owned()).or_default();
        if !subscribers.iter().any(|p| p == peer) {
            subscribers.push(peer.to_owned());
        }
    }

    /// Remove a peer from a channel's subscriber list.
    pub fn unsubscribe(&self, channel: &str, peer: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|p| p != peer);
        }
    }

    /// Snapshot of a channel's subscribers in insertion order.
    #[must_use]
    pub fn channel_subscribers(&self, channel: &str) -> Vec<PeerId> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(channel).cloned().unwrap_or_default()
    }

    // ── Log subscriptions ──

    /// Register a filtered log stream. A reused `subscriptionId` replaces
    /// the previous subscription.
    pub fn add_log_subscription(&self, sub: LogSubscription) {
        let mut subs = self.log_subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| s.id != sub.id);
        subs.push(sub);
    }

    /// Remove a log stream by id.
    pub fn remove_log_subscription(&self, id: &str) {
        let mut subs = self.log_subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| s.id != id);
    }

    /// Peers whose subscriptions match `entry`, in subscription order.
    #[must_use]
    pub fn matching_log_subscribers(&self, entry: &ConsoleLogEntry) -> Vec<PeerId> {
        let subs = self.log_subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.iter()
            .filter(|s| s.matches(entry))
            .map(|s| s.peer.clone())
            .collect()
    }

    // ── Disconnect sweep ──

    /// Remove every trace of a disconnected peer: its pending RPCs (their
    /// timeouts are cancelled), channel memberships, and log subscriptions.
    pub fn sweep_peer(&self, peer: &str) {
        let removed: Vec<PendingScreenshot> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.origin == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in &removed {
            entry.timeout.abort();
        }
        if !removed.is_empty() {
            debug!(peer = %peer, count = removed.len(), "cancelled pending requests on disconnect");
        }

        {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            for subscribers in channels.values_mut() {
                subscribers.retain(|p| p != peer);
            }
        }

        {
            let mut subs = self.log_subs.lock().unwrap_or_else(|e| e.into_inner());
            subs.retain(|s| s.peer != peer);
        }
    }
}
