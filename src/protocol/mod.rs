//! Wire protocol: one JSON object per WebSocket frame, UTF-8.
//!
//! Every request carries a `type` tag from a closed set ([`msg`]). Every
//! response carries `success` and `timestamp`; `data`, `error`, `requestId`,
//! `subscriptionId` and `channel` are optional. Response frames may omit
//! `type` entirely, indicating a reply to the previously forwarded request.
//! Unrecognised fields are ignored by recipients.
//!
//! The router forwards unmatched frames byte-for-byte, so [`Frame`] keeps the
//! raw text alongside the parsed value.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{ConsoleLogEntry, Dimensions, DevbarSettings, LogFilters};

/// Message `type` tags, grouped the way the router dispatches them.
pub mod msg {
    // Identity / info
    pub const BROWSER_CLIENT_READY: &str = "browser-client-ready";
    pub const CHECK_API_KEY: &str = "check-api-key";
    pub const API_KEY_STATUS: &str = "api-key-status";
    pub const SERVER_INFO: &str = "server-info";

    // Commands executed inside the page
    pub const SCREENSHOT: &str = "screenshot";
    pub const REQUEST_SCREENSHOT: &str = "request-screenshot";
    pub const SCREENSHOT_RESPONSE: &str = "screenshot-response";
    pub const QUERY_DOM: &str = "query-dom";
    pub const EXEC_JS: &str = "exec-js";
    pub const GET_LOGS: &str = "get-logs";
    pub const REFRESH: &str = "refresh";
    pub const GET_SCHEMA: &str = "get-schema";
    pub const GET_OUTLINE: &str = "get-outline";
    pub const GET_A11Y: &str = "get-a11y";
    pub const GET_VITALS: &str = "get-vitals";

    // Browser → persister
    pub const SAVE_SCREENSHOT: &str = "save-screenshot";
    pub const SCREENSHOT_SAVED: &str = "screenshot-saved";
    pub const SCREENSHOT_ERROR: &str = "screenshot-error";
    pub const DESIGN_REVIEW_SCREENSHOT: &str = "design-review-screenshot";
    pub const DESIGN_REVIEW_SAVED: &str = "design-review-saved";
    pub const DESIGN_REVIEW_ERROR: &str = "design-review-error";
    pub const SAVE_OUTLINE: &str = "save-outline";
    pub const OUTLINE_SAVED: &str = "outline-saved";
    pub const OUTLINE_ERROR: &str = "outline-error";
    pub const SAVE_SCHEMA: &str = "save-schema";
    pub const SCHEMA_SAVED: &str = "schema-saved";
    pub const SCHEMA_ERROR: &str = "schema-error";
    pub const SAVE_CONSOLE_LOGS: &str = "save-console-logs";
    pub const CONSOLE_LOGS_SAVED: &str = "console-logs-saved";
    pub const CONSOLE_LOGS_ERROR: &str = "console-logs-error";
    pub const SAVE_A11Y: &str = "save-a11y";
    pub const A11Y_SAVED: &str = "a11y-saved";
    pub const A11Y_ERROR: &str = "a11y-error";
    pub const SAVE_SETTINGS: &str = "save-settings";
    pub const SETTINGS_SAVED: &str = "settings-saved";
    pub const SETTINGS_ERROR: &str = "settings-error";
    pub const LOAD_SETTINGS: &str = "load-settings";
    pub const SETTINGS_LOADED: &str = "settings-loaded";

    // Channel pub/sub
    pub const SUBSCRIBE: &str = "subscribe";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const HMR_SCREENSHOT: &str = "hmr-screenshot";
    pub const HMR_SCREENSHOT_SAVED: &str = "hmr-screenshot-saved";

    // Log streaming
    pub const LOG_SUBSCRIBE: &str = "log-subscribe";
    pub const LOG_SUBSCRIBED: &str = "log-subscribed";
    pub const LOG_UNSUBSCRIBE: &str = "log-unsubscribe";
    pub const LOG_UNSUBSCRIBED: &str = "log-unsubscribed";
    pub const LOG_EVENT: &str = "log-event";
}

/// WebSocket close code for a rejected (non-localhost) origin.
pub const CLOSE_ORIGIN_REJECTED: u16 = 4001;

/// Name of the channel carrying hot-module-reload screenshots.
pub const HMR_CHANNEL: &str = "hmr-screenshots";

/// Host wall clock in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Frames ──────────────────────────────────────────────────────

/// Errors raised while parsing or shape-checking a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The text was not valid JSON.
    #[error("invalid JSON frame: {0}")]
    Parse(#[from] serde_json::Error),
    /// The frame parsed but was not a JSON object.
    #[error("frame is not a JSON object")]
    NotObject,
    /// The payload failed its shape guard.
    #[error("invalid {kind} data: {detail}")]
    Shape { kind: &'static str, detail: String },
}

/// One framed JSON message, keeping the raw text for byte-exact forwarding.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: String,
    value: Value,
}

impl Frame {
    /// Parse a text frame. Non-object frames are rejected.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(FrameError::NotObject);
        }
        Ok(Self {
            raw: raw.to_owned(),
            value,
        })
    }

    /// The `type` tag, if present. Response frames may omit it.
    #[must_use]
    pub fn msg_type(&self) -> Option<&str> {
        self.value.get("type").and_then(Value::as_str)
    }

    /// The correlation id, if present.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.value.get("requestId").and_then(Value::as_str)
    }

    /// The original frame text, unmodified.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed frame body.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Deserialise the frame body into a typed payload (shape guard).
    pub fn payload<T: DeserializeOwned>(&self, kind: &'static str) -> Result<T, FrameError> {
        serde_json::from_value(self.value.clone()).map_err(|e| FrameError::Shape {
            kind,
            detail: e.to_string(),
        })
    }
}

// ── Response builders ───────────────────────────────────────────

/// A typed response frame: `{type, success, timestamp}`.
#[must_use]
pub fn response(msg_type: &str, success: bool) -> Value {
    serde_json::json!({
        "type": msg_type,
        "success": success,
        "timestamp": now_ms(),
    })
}

/// An untyped failure frame: `{success:false, error, timestamp}`.
#[must_use]
pub fn failure(error: &str) -> Value {
    serde_json::json!({
        "success": false,
        "error": error,
        "timestamp": now_ms(),
    })
}

/// A typed failure frame: `{type, success:false, error, timestamp}`.
#[must_use]
pub fn typed_failure(msg_type: &str, error: &str) -> Value {
    serde_json::json!({
        "type": msg_type,
        "success": false,
        "error": error,
        "timestamp": now_ms(),
    })
}

// ── Typed payloads (shape guards) ───────────────────────────────

/// Payload of `save-screenshot`, `design-review-screenshot` and the data
/// carried by `hmr-screenshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotPayload {
    /// Base64 image, optionally as a `data:image/...;base64,` URL.
    pub screenshot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<ConsoleLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_vitals: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<Value>,
}

/// Payload of `save-outline`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlinePayload {
    pub outline: Value,
    pub markdown: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of `save-schema`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPayload {
    pub schemas: Value,
    pub markdown: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of `save-console-logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLogsPayload {
    pub logs: Vec<ConsoleLogEntry>,
    pub markdown: String,
}

/// Payload of `save-a11y`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A11yPayload {
    pub markdown: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of `save-settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsPayload {
    pub settings: DevbarSettings,
}

/// Payload of `subscribe` / `unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: String,
}

/// Payload of `log-subscribe` / `log-unsubscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSubscribePayload {
    pub subscription_id: String,
    #[serde(default)]
    pub filters: LogFilters,
}

/// Payload of a browser-pushed `log-event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEventPayload {
    pub data: ConsoleLogEntry,
}

/// Data carried by a browser-pushed `hmr-screenshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HmrScreenshotData {
    pub screenshot: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Payload of `hmr-screenshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmrScreenshotPayload {
    pub data: HmrScreenshotData,
}
