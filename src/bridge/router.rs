//! Message routing: one framed JSON message in, exactly one outcome out.
//!
//! A frame either hits a typed handler, is forwarded between the CLI and
//! browser sides, or is rejected because no browser peer is connected.
//! Handlers catch their own failures and convert them to failure frames
//! addressed to the offending peer; nothing here tears down the server.
//!
//! The browser-push handlers (`save-*`, `screenshot-response`,
//! `hmr-screenshot`, `log-event`) only fire for peers already promoted to
//! `browser`; from an unpromoted peer the same frames fall through to the
//! forward path, so nothing persists on behalf of a peer that never
//! announced itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::bridge::peer::Peer;
use crate::bridge::registry::{LogSubscription, PendingScreenshot};
use crate::bridge::review::ApiKeyStatus;
use crate::bridge::BridgeState;
use crate::protocol::{
    self, msg, A11yPayload, ChannelPayload, ConsoleLogsPayload, Frame, HmrScreenshotPayload,
    LogEventPayload, LogSubscribePayload, OutlinePayload, SchemaPayload, ScreenshotPayload,
    SettingsPayload, HMR_CHANNEL,
};

const NO_BROWSER_ERROR: &str = "No browser client connected";
const SCREENSHOT_TIMEOUT_ERROR: &str = "Screenshot request timed out";

/// Dispatch one raw text frame from `peer`.
pub async fn dispatch(state: &Arc<BridgeState>, peer: &Arc<Peer>, raw: &str) {
    let frame = match Frame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(peer = %peer.id(), error = %e, "unparseable frame");
            send(peer, &protocol::failure("Invalid message format"));
            return;
        }
    };

    match frame.msg_type() {
        Some(msg::BROWSER_CLIENT_READY) => browser_ready(state, peer),
        Some(msg::CHECK_API_KEY) => check_api_key(state, peer),
        Some(msg::SUBSCRIBE) => subscribe(state, peer, &frame),
        Some(msg::UNSUBSCRIBE) => unsubscribe(state, peer, &frame),
        Some(msg::LOG_SUBSCRIBE) => log_subscribe(state, peer, &frame),
        Some(msg::LOG_UNSUBSCRIBE) => log_unsubscribe(state, peer, &frame),
        Some(msg::REQUEST_SCREENSHOT) if !peer.is_browser() => {
            request_screenshot(state, peer, &frame);
        }
        Some(msg::SCREENSHOT_RESPONSE) if peer.is_browser() => {
            screenshot_response(state, &frame);
        }
        Some(msg::SAVE_SCREENSHOT) if peer.is_browser() => {
            save_screenshot(state, peer, &frame).await;
        }
        Some(msg::DESIGN_REVIEW_SCREENSHOT) if peer.is_browser() => {
            design_review(state, peer, &frame).await;
        }
        Some(msg::SAVE_OUTLINE) if peer.is_browser() => save_outline(state, peer, &frame).await,
        Some(msg::SAVE_SCHEMA) if peer.is_browser() => save_schema(state, peer, &frame).await,
        Some(msg::SAVE_CONSOLE_LOGS) if peer.is_browser() => {
            save_console_logs(state, peer, &frame).await;
        }
        Some(msg::SAVE_A11Y) if peer.is_browser() => save_a11y(state, peer, &frame).await,
        Some(msg::SAVE_SETTINGS) if peer.is_browser() => save_settings(state, peer, &frame).await,
        Some(msg::LOAD_SETTINGS) if peer.is_browser() => load_settings(state, peer).await,
        Some(msg::HMR_SCREENSHOT) if peer.is_browser() => {
            hmr_screenshot(state, peer, &frame).await;
        }
        Some(msg::LOG_EVENT) if peer.is_browser() => log_event(state, &frame),
        _ => forward(state, peer, &frame),
    }
}

fn send(peer: &Peer, value: &serde_json::Value) {
    if !peer.send_text(value.to_string()) {
        debug!(peer = %peer.id(), "dropping frame for closed peer");
    }
}

// ── Identity / info ─────────────────────────────────────────────

fn browser_ready(state: &Arc<BridgeState>, peer: &Arc<Peer>) {
    if peer.promote() {
        state.peers.record_browser(peer.id());
    }
    let info = json!({
        "type": msg::SERVER_INFO,
        "appPort": state.config.server.app_port,
        "wsPort": state.port,
        "timestamp": protocol::now_ms(),
    });
    send(peer, &info);
}

fn check_api_key(state: &Arc<BridgeState>, peer: &Arc<Peer>) {
    let status = ApiKeyStatus::probe(&state.config.review.model);
    let mut reply = match serde_json::to_value(&status) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "api-key status serialisation failed");
            send(peer, &protocol::failure("Internal error"));
            return;
        }
    };
    reply["type"] = json!(msg::API_KEY_STATUS);
    reply["success"] = json!(true);
    reply["timestamp"] = json!(protocol::now_ms());
    send(peer, &reply);
}

// ── Screenshot RPC ──────────────────────────────────────────────

fn request_screenshot(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let Some(browser) = state.peers.preferred_browser() else {
        send(peer, &protocol::failure(NO_BROWSER_ERROR));
        return;
    };

    let request_id = frame
        .request_id()
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let timeout = tokio::spawn(expire_pending(
        Arc::clone(state),
        request_id.clone(),
        Duration::from_millis(state.config.server.screenshot_timeout_ms),
    ));
    state.registry.insert_pending(
        request_id.clone(),
        PendingScreenshot {
            origin: peer.id().to_owned(),
            timeout,
        },
    );

    // Forward byte-for-byte when the CLI already chose a requestId; only a
    // minted id forces a re-encode.
    if frame.request_id().is_some() {
        browser.send_text(frame.raw().to_owned());
    } else {
        let mut value = frame.value().clone();
        value["requestId"] = json!(request_id);
        browser.send_text(value.to_string());
    }
}

async fn expire_pending(state: Arc<BridgeState>, request_id: String, budget: Duration) {
    tokio::time::sleep(budget).await;
    let Some(entry) = state.registry.take_pending(&request_id) else {
        return;
    };
    warn!(request_id = %request_id, "screenshot request timed out");
    let failure = json!({
        "type": msg::SCREENSHOT_RESPONSE,
        "requestId": request_id,
        "success": false,
        "error": SCREENSHOT_TIMEOUT_ERROR,
        "timestamp": protocol::now_ms(),
    });
    if let Some(origin) = state.peers.get(&entry.origin) {
        send(&origin, &failure);
    }
}

fn screenshot_response(state: &Arc<BridgeState>, frame: &Frame) {
    let Some(request_id) = frame.request_id() else {
        debug!("screenshot-response without requestId dropped");
        return;
    };
    let Some(entry) = state.registry.take_pending(request_id) else {
        debug!(request_id, "late screenshot-response dropped");
        return;
    };
    entry.timeout.abort();
    if let Some(origin) = state.peers.get(&entry.origin) {
        if origin.is_open() {
            origin.send_text(frame.raw().to_owned());
        }
    }
}

// ── Browser → persister ─────────────────────────────────────────

async fn save_screenshot(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: ScreenshotPayload = match frame.payload("screenshot") {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "save-screenshot shape guard failed");
            send(
                peer,
                &protocol::typed_failure(msg::SCREENSHOT_ERROR, "Invalid screenshot data"),
            );
            return;
        }
    };
    match state.store.save_screenshot(&payload).await {
        Ok(saved) => {
            let mut reply = protocol::response(msg::SCREENSHOT_SAVED, true);
            reply["path"] = json!(saved.image_path.display().to_string());
            reply["metadataPath"] = json!(saved.metadata_path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::SCREENSHOT_ERROR, &e.to_string()),
        ),
    }
}

async fn design_review(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: ScreenshotPayload = match frame.payload("design-review") {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "design-review shape guard failed");
            send(
                peer,
                &protocol::typed_failure(msg::DESIGN_REVIEW_ERROR, "Invalid design review data"),
            );
            return;
        }
    };

    let Some(reviewer) = state.reviewer.clone() else {
        send(
            peer,
            &protocol::typed_failure(msg::DESIGN_REVIEW_ERROR, "No design reviewer configured"),
        );
        return;
    };

    let review = match reviewer.review(&payload, &state.config.review.model).await {
        Ok(review) => review,
        Err(e) => {
            warn!(error = %e, "design review failed");
            send(
                peer,
                &protocol::typed_failure(msg::DESIGN_REVIEW_ERROR, &e.to_string()),
            );
            return;
        }
    };

    match state.store.save_design_review(&payload, &review).await {
        Ok(saved) => {
            let mut reply = protocol::response(msg::DESIGN_REVIEW_SAVED, true);
            reply["screenshotPath"] = json!(saved.screenshot_path.display().to_string());
            reply["reviewPath"] = json!(saved.review_path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::DESIGN_REVIEW_ERROR, &e.to_string()),
        ),
    }
}

async fn save_outline(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: OutlinePayload = match frame.payload("outline") {
        Ok(payload) => payload,
        Err(_) => {
            send(
                peer,
                &protocol::typed_failure(msg::OUTLINE_ERROR, "Invalid outline data"),
            );
            return;
        }
    };
    match state.store.save_outline(&payload).await {
        Ok(path) => {
            let mut reply = protocol::response(msg::OUTLINE_SAVED, true);
            reply["path"] = json!(path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::OUTLINE_ERROR, &e.to_string()),
        ),
    }
}

async fn save_schema(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: SchemaPayload = match frame.payload("schema") {
        Ok(payload) => payload,
        Err(_) => {
            send(
                peer,
                &protocol::typed_failure(msg::SCHEMA_ERROR, "Invalid schema data"),
            );
            return;
        }
    };
    match state.store.save_schema(&payload).await {
        Ok(path) => {
            let mut reply = protocol::response(msg::SCHEMA_SAVED, true);
            reply["path"] = json!(path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::SCHEMA_ERROR, &e.to_string()),
        ),
    }
}

async fn save_console_logs(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: ConsoleLogsPayload = match frame.payload("console-logs") {
        Ok(payload) => payload,
        Err(_) => {
            send(
                peer,
                &protocol::typed_failure(msg::CONSOLE_LOGS_ERROR, "Invalid console logs data"),
            );
            return;
        }
    };
    match state.store.save_console_logs(&payload).await {
        Ok(path) => {
            let mut reply = protocol::response(msg::CONSOLE_LOGS_SAVED, true);
            reply["path"] = json!(path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::CONSOLE_LOGS_ERROR, &e.to_string()),
        ),
    }
}

async fn save_a11y(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: A11yPayload = match frame.payload("a11y") {
        Ok(payload) => payload,
        Err(_) => {
            send(
                peer,
                &protocol::typed_failure(msg::A11Y_ERROR, "Invalid a11y data"),
            );
            return;
        }
    };
    match state.store.save_a11y(&payload).await {
        Ok(path) => {
            let mut reply = protocol::response(msg::A11Y_SAVED, true);
            reply["path"] = json!(path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::A11Y_ERROR, &e.to_string()),
        ),
    }
}

async fn save_settings(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: SettingsPayload = match frame.payload("settings") {
        Ok(payload) => payload,
        Err(_) => {
            send(
                peer,
                &protocol::typed_failure(msg::SETTINGS_ERROR, "Invalid settings data"),
            );
            return;
        }
    };
    match state.store.save_settings(&payload.settings).await {
        Ok(path) => {
            let mut reply = protocol::response(msg::SETTINGS_SAVED, true);
            reply["path"] = json!(path.display().to_string());
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::SETTINGS_ERROR, &e.to_string()),
        ),
    }
}

async fn load_settings(state: &Arc<BridgeState>, peer: &Arc<Peer>) {
    match state.store.load_settings().await {
        Ok(settings) => {
            let mut reply = protocol::response(msg::SETTINGS_LOADED, true);
            reply["settings"] = serde_json::to_value(&settings).unwrap_or(json!({}));
            send(peer, &reply);
        }
        Err(e) => send(
            peer,
            &protocol::typed_failure(msg::SETTINGS_ERROR, &e.to_string()),
        ),
    }
}

// ── Channel pub/sub ─────────────────────────────────────────────

fn subscribe(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: ChannelPayload = match frame.payload("subscribe") {
        Ok(payload) => payload,
        Err(_) => {
            send(peer, &protocol::failure("Invalid subscribe data"));
            return;
        }
    };
    state.registry.subscribe(&payload.channel, peer.id());
    let mut reply = protocol::response(msg::SUBSCRIBED, true);
    reply["channel"] = json!(payload.channel);
    send(peer, &reply);
}

fn unsubscribe(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: ChannelPayload = match frame.payload("unsubscribe") {
        Ok(payload) => payload,
        Err(_) => {
            send(peer, &protocol::failure("Invalid unsubscribe data"));
            return;
        }
    };
    state.registry.unsubscribe(&payload.channel, peer.id());
    let mut reply = protocol::response(msg::UNSUBSCRIBED, true);
    reply["channel"] = json!(payload.channel);
    send(peer, &reply);
}

async fn hmr_screenshot(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: HmrScreenshotPayload = match frame.payload("hmr-screenshot") {
        Ok(payload) => payload,
        Err(_) => {
            send(peer, &protocol::failure("Invalid hmr-screenshot data"));
            return;
        }
    };

    let screenshot = ScreenshotPayload {
        screenshot: payload.data.screenshot,
        url: None,
        timestamp: payload.data.timestamp,
        dimensions: None,
        logs: vec![],
        web_vitals: None,
        page_size: None,
    };
    let saved = match state.store.save_screenshot(&screenshot).await {
        Ok(saved) => saved,
        Err(e) => {
            send(peer, &protocol::failure(&e.to_string()));
            return;
        }
    };

    let mut event = protocol::response(msg::HMR_SCREENSHOT_SAVED, true);
    event["trigger"] = json!(payload.data.trigger);
    event["changedFile"] = json!(payload.data.changed_file);
    event["path"] = json!(saved.image_path.display().to_string());
    event["metadataPath"] = json!(saved.metadata_path.display().to_string());
    let text = event.to_string();

    // Fan out in insertion order; dead sockets are elided, and the pushing
    // peer is acked separately below.
    for subscriber in state.registry.channel_subscribers(HMR_CHANNEL) {
        if subscriber == peer.id() {
            continue;
        }
        if let Some(sub) = state.peers.get(&subscriber) {
            if sub.is_open() {
                sub.send_text(text.clone());
            }
        }
    }

    send(peer, &event);
}

// ── Log streaming ───────────────────────────────────────────────

fn log_subscribe(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: LogSubscribePayload = match frame.payload("log-subscribe") {
        Ok(payload) => payload,
        Err(_) => {
            send(peer, &protocol::failure("Invalid log-subscribe data"));
            return;
        }
    };
    state.registry.add_log_subscription(LogSubscription::new(
        payload.subscription_id.clone(),
        peer.id().to_owned(),
        payload.filters,
    ));
    let mut reply = protocol::response(msg::LOG_SUBSCRIBED, true);
    reply["subscriptionId"] = json!(payload.subscription_id);
    send(peer, &reply);
}

fn log_unsubscribe(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    let payload: LogSubscribePayload = match frame.payload("log-unsubscribe") {
        Ok(payload) => payload,
        Err(_) => {
            send(peer, &protocol::failure("Invalid log-unsubscribe data"));
            return;
        }
    };
    state.registry.remove_log_subscription(&payload.subscription_id);
    let mut reply = protocol::response(msg::LOG_UNSUBSCRIBED, true);
    reply["subscriptionId"] = json!(payload.subscription_id);
    send(peer, &reply);
}

fn log_event(state: &Arc<BridgeState>, frame: &Frame) {
    let payload: LogEventPayload = match frame.payload("log-event") {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "malformed log-event dropped");
            return;
        }
    };
    for subscriber in state.registry.matching_log_subscribers(&payload.data) {
        if let Some(sub) = state.peers.get(&subscriber) {
            if sub.is_open() {
                sub.send_text(frame.raw().to_owned());
            }
        }
    }
}

// ── Forwarding ──────────────────────────────────────────────────

/// The default arm: CLI frames go to the preferred browser peer with the
/// sender registered as reply target; unmatched browser frames are the reply
/// and go back to whoever is registered.
fn forward(state: &Arc<BridgeState>, peer: &Arc<Peer>, frame: &Frame) {
    if peer.is_browser() {
        match state.take_reply_target(peer.id()) {
            Some(cli_id) => {
                if let Some(cli) = state.peers.get(&cli_id) {
                    if cli.is_open() {
                        cli.send_text(frame.raw().to_owned());
                    }
                }
            }
            None => {
                debug!(peer = %peer.id(), msg_type = ?frame.msg_type(), "browser frame with no reply target dropped");
            }
        }
        return;
    }

    match state.peers.preferred_browser() {
        Some(browser) => {
            state.register_reply_target(browser.id(), peer.id());
            browser.send_text(frame.raw().to_owned());
        }
        None => send(peer, &protocol::failure(NO_BROWSER_ERROR)),
    }
}
