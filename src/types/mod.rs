// Core types shared between the bridge server and the devbar runtime.

use serde::{Deserialize, Serialize};

/// Severity of a captured console entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Plain `console.log` output.
    Log,
    /// `console.error` output, uncaught errors, unhandled rejections.
    Error,
    /// `console.warn` output.
    Warn,
    /// `console.info` output.
    Info,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => f.write_str("log"),
            Self::Error => f.write_str("error"),
            Self::Warn => f.write_str("warn"),
            Self::Info => f.write_str("info"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            other => Err(anyhow::anyhow!("unknown log level: {other}")),
        }
    }
}

/// One captured console entry.
///
/// `timestamp` is host wall-clock epoch milliseconds. Receivers never compare
/// timestamps across peers for ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Filters attached to a log subscription.
///
/// An event is delivered iff every provided filter matches; unspecified
/// filters match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilters {
    /// Level membership filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<LogLevel>>,
    /// Regex matched against the entry message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Exact match against the entry source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Pixel dimensions reported with a screenshot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Devbar UI mode persisted with its settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiMode {
    Collapsed,
    #[default]
    Compact,
    Expanded,
}

/// Devbar settings persisted at `.sweetlink/settings.json`.
///
/// Unknown fields are preserved through a save/load round trip so that newer
/// devbar builds can talk to an older bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevbarSettings {
    #[serde(default)]
    pub mode: UiMode,
    /// Push a screenshot on every hot-module-reload event.
    #[serde(default)]
    pub hmr_screenshots: bool,
    #[serde(default)]
    pub notifications: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
