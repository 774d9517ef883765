//! Bridge configuration loading and management.
//!
//! Loads configuration from `.sweetlink/config.toml` (or `$SWEETLINK_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Fixed offset between the consuming app's HTTP port and the bridge's
/// WebSocket port, chosen so that `app:3000 → ws:9223`.
pub const PORT_OFFSET: u16 = 6223;

/// Default HTTP port of the consuming application.
pub const DEFAULT_APP_PORT: u16 = 3000;

/// How many consecutive ports to try past the requested one when binding.
pub const DEFAULT_PORT_RETRIES: u16 = 10;

/// How long the bridge waits for a `screenshot-response` before synthesising
/// a failure frame to the requesting CLI peer.
pub const DEFAULT_SCREENSHOT_TIMEOUT_MS: u64 = 30_000;

// ── Top-level config ────────────────────────────────────────────

/// Top-level bridge configuration loaded from TOML.
///
/// Path: `.sweetlink/config.toml` or `$SWEETLINK_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WebSocket server settings (`[server]`).
    pub server: ServerConfig,
    /// Design-review collaborator settings (`[review]`).
    pub review: ReviewConfig,
}

/// Server settings: ports, retry budget, timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket port. When unset, derived as `app_port + 6223`.
    pub port: Option<u16>,
    /// The consuming application's HTTP port.
    pub app_port: u16,
    /// Consecutive ports to try past `port` when the bind fails.
    pub port_retries: u16,
    /// Budget for a pending screenshot RPC, in milliseconds.
    pub screenshot_timeout_ms: u64,
    /// Production mode disables developer-only capabilities (`exec-js`).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            app_port: DEFAULT_APP_PORT,
            port_retries: DEFAULT_PORT_RETRIES,
            screenshot_timeout_ms: DEFAULT_SCREENSHOT_TIMEOUT_MS,
            production: false,
        }
    }
}

/// Design-review collaborator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Model identifier reported by the `check-api-key` handler.
    pub model: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_owned(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$SWEETLINK_CONFIG_PATH` or `.sweetlink/config.toml`.
    /// If the file does not exist, returns defaults (backward compatible).
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// The effective WebSocket port: explicit `port`, else `app_port + 6223`.
    #[must_use]
    pub fn ws_port(&self) -> u16 {
        self.server
            .port
            .unwrap_or_else(|| self.server.app_port.saturating_add(PORT_OFFSET))
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: BridgeConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file found, using defaults");
                Ok(BridgeConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("SWEETLINK_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(".sweetlink/config.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(port) = env("SWEETLINK_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = Some(port);
        }
        if let Some(app_port) = env("SWEETLINK_APP_PORT").and_then(|v| v.parse().ok()) {
            self.server.app_port = app_port;
        }
        if let Some(env_name) = env("SWEETLINK_ENV") {
            self.server.production = env_name.eq_ignore_ascii_case("production");
        }
        if let Some(model) = env("SWEETLINK_REVIEW_MODEL") {
            self.review.model = model;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.server.app_port, 3000);
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.port_retries, 10);
        assert_eq!(config.server.screenshot_timeout_ms, 30_000);
        assert!(!config.server.production);
        assert_eq!(config.ws_port(), 9223);
    }

    #[test]
    fn test_ws_port_derivation() {
        let mut config = BridgeConfig::default();
        config.server.app_port = 5173;
        assert_eq!(config.ws_port(), 11396);

        config.server.port = Some(9999);
        assert_eq!(config.ws_port(), 9999);
    }

    #[test]
    fn test_parse_toml() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            app_port = 4000
            port_retries = 5

            [review]
            model = "claude-haiku-4"
            "#,
        )
        .expect("parse config");
        assert_eq!(config.server.app_port, 4000);
        assert_eq!(config.server.port_retries, 5);
        assert_eq!(config.ws_port(), 10223);
        assert_eq!(config.review.model, "claude-haiku-4");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config.apply_overrides(|key| match key {
            "SWEETLINK_PORT" => Some("9300".to_owned()),
            "SWEETLINK_APP_PORT" => Some("3001".to_owned()),
            "SWEETLINK_ENV" => Some("production".to_owned()),
            _ => None,
        });
        assert_eq!(config.server.port, Some(9300));
        assert_eq!(config.server.app_port, 3001);
        assert!(config.server.production);
        assert_eq!(config.ws_port(), 9300);
    }

    #[test]
    fn test_config_path_env_override() {
        let path = BridgeConfig::config_path_with(|key| {
            (key == "SWEETLINK_CONFIG_PATH").then(|| "/tmp/custom.toml".to_owned())
        });
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));

        let default = BridgeConfig::config_path_with(|_| None);
        assert_eq!(default, PathBuf::from(".sweetlink/config.toml"));
    }
}
