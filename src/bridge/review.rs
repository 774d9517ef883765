//! Design-review collaborator seam.
//!
//! The actual review text is produced outside the core (a Claude API
//! client); the bridge persists whatever the reviewer returns. The trait is
//! the whole interface: tests plug in a fake, the binary runs without one.

use async_trait::async_trait;
use serde::Serialize;

use crate::protocol::ScreenshotPayload;

/// USD per million input tokens reported by `check-api-key`.
const PRICE_INPUT_PER_MTOK: f64 = 3.0;

/// USD per million output tokens reported by `check-api-key`.
const PRICE_OUTPUT_PER_MTOK: f64 = 15.0;

/// Produces review markdown for a screenshot payload.
#[async_trait]
pub trait DesignReviewer: Send + Sync {
    /// Review the page captured in `payload` and return markdown.
    async fn review(&self, payload: &ScreenshotPayload, model: &str) -> anyhow::Result<String>;
}

/// Reply body of the `check-api-key` handler. The key itself is never
/// placed in a frame.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyStatus {
    pub configured: bool,
    pub model: String,
    pub pricing: Pricing,
}

/// Model pricing advertised to the devbar, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
}

impl ApiKeyStatus {
    /// Probe `ANTHROPIC_API_KEY` and assemble the status reply.
    #[must_use]
    pub fn probe(model: &str) -> Self {
        let configured = std::env::var("ANTHROPIC_API_KEY")
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        Self {
            configured,
            model: model.to_owned(),
            pricing: Pricing {
                input: PRICE_INPUT_PER_MTOK,
                output: PRICE_OUTPUT_PER_MTOK,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialises_without_key_material() {
        let status = ApiKeyStatus {
            configured: true,
            model: "claude-sonnet-4-20250514".to_owned(),
            pricing: Pricing {
                input: 3.0,
                output: 15.0,
            },
        };
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["configured"], true);
        assert_eq!(json["pricing"]["input"], 3.0);
        assert!(json.get("key").is_none());
        assert!(json.get("apiKey").is_none());
    }
}
