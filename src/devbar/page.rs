//! The seam between the devbar runtime and the page it lives in.
//!
//! DOM access, rendering, and capture are the host page's business; the
//! devbar only needs this trait. Tests plug in a fake, the real
//! implementation lives with the in-page UI.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::Dimensions;

/// Errors surfaced by page operations.
#[derive(Debug, Error)]
pub enum PageError {
    /// Screenshot capture failed.
    #[error("capture failed: {0}")]
    Capture(String),
    /// A script or selector evaluation threw.
    #[error("{0}")]
    Eval(String),
    /// The page host does not implement this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Encoding requested for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// Capture parameters assembled by the command handlers.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Capture the full page height instead of the current viewport.
    pub full_page: bool,
    /// Restrict the capture to the first element matching this selector.
    pub selector: Option<String>,
    pub format: ImageFormat,
    /// JPEG quality in `0.0..=1.0`; ignored for PNG.
    pub quality: f64,
    /// Output scale factor; `1.0` is native resolution.
    pub scale: f64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            full_page: true,
            selector: None,
            format: ImageFormat::Png,
            quality: 1.0,
            scale: 1.0,
        }
    }
}

/// A completed capture: the encoded image plus its pixel dimensions.
#[derive(Debug, Clone)]
pub struct Capture {
    /// `data:image/...;base64,` URL.
    pub data_url: String,
    pub dimensions: Dimensions,
}

/// One element matched by `query-dom`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomMatch {
    pub tag_name: String,
    pub class_name: String,
    pub id: String,
    pub text_content: String,
    /// The requested property's value, when the query named one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_value: Option<Value>,
}

/// Page operations the devbar depends on.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Capture the page (or a selector within it) as an encoded image.
    async fn capture(&self, options: &CaptureOptions) -> Result<Capture, PageError>;

    /// Evaluate a selector, optionally reading `property` from each match.
    async fn query_dom(
        &self,
        selector: &str,
        property: Option<&str>,
    ) -> Result<Vec<DomMatch>, PageError>;

    /// Indirect-eval a script and return its serialisable result.
    async fn eval(&self, code: &str) -> Result<Value, PageError>;

    /// Extract structured-data schemas (JSON-LD and friends).
    async fn schema(&self) -> Result<Value, PageError>;

    /// Extract the heading/landmark outline.
    async fn outline(&self) -> Result<Value, PageError>;

    /// Run the accessibility audit.
    async fn a11y(&self) -> Result<Value, PageError>;

    /// Collect web vitals observed so far.
    async fn vitals(&self) -> Result<Value, PageError>;

    /// Reload the page.
    async fn refresh(&self) -> Result<(), PageError>;

    /// The page's current URL.
    fn page_url(&self) -> String;
}
