//! Command handlers: execute bridge commands inside the page and build the
//! reply frame.
//!
//! Each handler is an async function from a command payload to a response
//! payload. Failures are caught at the handler boundary and become
//! `{success:false, error}` replies; a handler never responds twice and
//! never takes the connection down.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::devbar::console::ConsoleRing;
use crate::devbar::page::{CaptureOptions, ImageFormat, PageDriver};
use crate::protocol::{self, msg, Frame};
use crate::types::LogLevel;

/// `exec-js` scripts past this length are rejected even in development.
pub const EXEC_JS_MAX_LEN: usize = 10_000;

/// Default JPEG quality for the server-initiated screenshot RPC.
pub(crate) const RPC_DEFAULT_QUALITY: f64 = 0.7;

/// Default scale factor for the server-initiated screenshot RPC.
pub(crate) const RPC_DEFAULT_SCALE: f64 = 0.25;

/// DOM text content is clipped to this many characters per match.
const TEXT_CONTENT_CLIP: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotCommand {
    #[serde(default = "default_true")]
    full_page: bool,
    selector: Option<String>,
    format: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestScreenshotCommand {
    quality: Option<f64>,
    scale: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QueryDomCommand {
    selector: String,
    property: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetLogsCommand {
    level: Option<LogLevel>,
    filter: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExecJsCommand {
    code: String,
}

/// Executes command frames against the host page.
pub struct CommandHandlers {
    driver: Arc<dyn PageDriver>,
    console: Arc<ConsoleRing>,
    /// Production pages refuse `exec-js` outright.
    production: bool,
}

impl CommandHandlers {
    #[must_use]
    pub fn new(driver: Arc<dyn PageDriver>, console: Arc<ConsoleRing>, production: bool) -> Self {
        Self {
            driver,
            console,
            production,
        }
    }

    /// Dispatch one command frame. Returns `None` for frames that are not
    /// commands (the connection layer ignores those).
    pub async fn handle(&self, frame: &Frame) -> Option<Value> {
        let reply = match frame.msg_type()? {
            msg::SCREENSHOT => self.screenshot(frame).await,
            msg::REQUEST_SCREENSHOT => return Some(self.request_screenshot(frame).await),
            msg::QUERY_DOM => self.query_dom(frame).await,
            msg::GET_LOGS => self.get_logs(frame),
            msg::EXEC_JS => self.exec_js(frame).await,
            msg::GET_SCHEMA => self.extract(frame, "schema").await,
            msg::GET_OUTLINE => self.extract(frame, "outline").await,
            msg::GET_A11Y => self.extract(frame, "a11y").await,
            msg::GET_VITALS => self.extract(frame, "vitals").await,
            msg::REFRESH => self.refresh().await,
            other => {
                debug!(msg_type = other, "unknown command ignored");
                return None;
            }
        };
        Some(with_request_id(reply, frame))
    }

    async fn screenshot(&self, frame: &Frame) -> Value {
        let command: ScreenshotCommand = match frame.payload("screenshot") {
            Ok(command) => command,
            Err(_) => return protocol::failure("Invalid screenshot data"),
        };
        let options = CaptureOptions {
            full_page: command.full_page,
            selector: command.selector,
            format: match command.format.as_deref() {
                Some("jpeg" | "jpg") => ImageFormat::Jpeg,
                _ => ImageFormat::Png,
            },
            ..CaptureOptions::default()
        };
        match self.driver.capture(&options).await {
            Ok(capture) => success_with(json!({
                "screenshot": capture.data_url,
                "dimensions": capture.dimensions,
                "url": self.driver.page_url(),
            })),
            Err(e) => protocol::failure(&e.to_string()),
        }
    }

    /// Server-initiated capture: scaled-down JPEG, `requestId` carried
    /// through, reply typed `screenshot-response`.
    async fn request_screenshot(&self, frame: &Frame) -> Value {
        let command: RequestScreenshotCommand = frame
            .payload("request-screenshot")
            .unwrap_or(RequestScreenshotCommand {
                quality: None,
                scale: None,
            });
        let options = CaptureOptions {
            full_page: false,
            selector: None,
            format: ImageFormat::Jpeg,
            quality: command.quality.unwrap_or(RPC_DEFAULT_QUALITY),
            scale: command.scale.unwrap_or(RPC_DEFAULT_SCALE),
        };
        let mut reply = match self.driver.capture(&options).await {
            Ok(capture) => {
                let mut reply = protocol::response(msg::SCREENSHOT_RESPONSE, true);
                reply["data"] = json!({
                    "screenshot": capture.data_url,
                    "dimensions": capture.dimensions,
                    "url": self.driver.page_url(),
                });
                reply
            }
            Err(e) => protocol::typed_failure(msg::SCREENSHOT_RESPONSE, &e.to_string()),
        };
        if let Some(request_id) = frame.request_id() {
            reply["requestId"] = json!(request_id);
        }
        reply
    }

    async fn query_dom(&self, frame: &Frame) -> Value {
        let command: QueryDomCommand = match frame.payload("query-dom") {
            Ok(command) => command,
            Err(_) => return protocol::failure("Invalid query-dom data"),
        };
        match self
            .driver
            .query_dom(&command.selector, command.property.as_deref())
            .await
        {
            Ok(matches) => {
                let results: Vec<Value> = if command.property.is_some() {
                    matches
                        .iter()
                        .map(|m| m.property_value.clone().unwrap_or(Value::Null))
                        .collect()
                } else {
                    matches
                        .iter()
                        .map(|m| {
                            json!({
                                "tagName": m.tag_name,
                                "className": m.class_name,
                                "id": m.id,
                                "textContent": clip(&m.text_content, TEXT_CONTENT_CLIP),
                            })
                        })
                        .collect()
                };
                success_with(json!({
                    "count": matches.len(),
                    "results": results,
                }))
            }
            Err(e) => protocol::failure(&e.to_string()),
        }
    }

    fn get_logs(&self, frame: &Frame) -> Value {
        let command: GetLogsCommand = match frame.payload("get-logs") {
            Ok(command) => command,
            Err(_) => return protocol::failure("Invalid get-logs data"),
        };
        let logs = self
            .console
            .filtered(command.level, command.filter.as_deref(), command.limit);
        success_with(json!({
            "logs": logs,
            "errorCount": self.console.error_count(),
            "warningCount": self.console.warning_count(),
        }))
    }

    async fn exec_js(&self, frame: &Frame) -> Value {
        if self.production {
            return protocol::failure("exec-js is disabled in production");
        }
        let command: ExecJsCommand = match frame.payload("exec-js") {
            Ok(command) => command,
            Err(_) => return protocol::failure("Invalid exec-js data"),
        };
        if command.code.len() > EXEC_JS_MAX_LEN {
            return protocol::failure("Script exceeds maximum length");
        }
        match self.driver.eval(&command.code).await {
            Ok(result) => success_with(result),
            Err(e) => protocol::failure(&e.to_string()),
        }
    }

    async fn extract(&self, _frame: &Frame, what: &str) -> Value {
        let result = match what {
            "schema" => self.driver.schema().await,
            "outline" => self.driver.outline().await,
            "a11y" => self.driver.a11y().await,
            _ => self.driver.vitals().await,
        };
        match result {
            Ok(data) => success_with(data),
            Err(e) => protocol::failure(&e.to_string()),
        }
    }

    async fn refresh(&self) -> Value {
        match self.driver.refresh().await {
            Ok(()) => success_with(Value::Null),
            Err(e) => protocol::failure(&e.to_string()),
        }
    }
}

fn success_with(data: Value) -> Value {
    json!({
        "success": true,
        "data": data,
        "timestamp": protocol::now_ms(),
    })
}

fn with_request_id(mut reply: Value, frame: &Frame) -> Value {
    if let Some(request_id) = frame.request_id() {
        reply["requestId"] = json!(request_id);
    }
    reply
}

/// Clip to at most `max` characters on a char boundary.
fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devbar::page::{Capture, DomMatch, PageError};
    use crate::types::Dimensions;
    use async_trait::async_trait;

    /// Scripted page used by the handler tests.
    struct FakePage {
        fail_capture: bool,
    }

    impl FakePage {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_capture: false,
            })
        }
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn capture(&self, options: &CaptureOptions) -> Result<Capture, PageError> {
            if self.fail_capture {
                return Err(PageError::Capture("canvas unavailable".to_owned()));
            }
            let mime = match options.format {
                ImageFormat::Png => "image/png",
                ImageFormat::Jpeg => "image/jpeg",
            };
            Ok(Capture {
                data_url: format!("data:{mime};base64,aGk="),
                dimensions: Dimensions {
                    width: 1280,
                    height: 720,
                },
            })
        }

        async fn query_dom(
            &self,
            selector: &str,
            property: Option<&str>,
        ) -> Result<Vec<DomMatch>, PageError> {
            if selector == "h1" {
                Ok(vec![DomMatch {
                    tag_name: "H1".to_owned(),
                    class_name: "hero".to_owned(),
                    id: String::new(),
                    text_content: "Hello".to_owned(),
                    property_value: property.map(|p| json!(format!("value-of-{p}"))),
                }])
            } else {
                Ok(vec![])
            }
        }

        async fn eval(&self, code: &str) -> Result<Value, PageError> {
            if code.contains("throw") {
                Err(PageError::Eval("boom".to_owned()))
            } else {
                Ok(json!(42))
            }
        }

        async fn schema(&self) -> Result<Value, PageError> {
            Ok(json!({"schemas": []}))
        }

        async fn outline(&self) -> Result<Value, PageError> {
            Ok(json!({"outline": []}))
        }

        async fn a11y(&self) -> Result<Value, PageError> {
            Ok(json!({"violations": []}))
        }

        async fn vitals(&self) -> Result<Value, PageError> {
            Ok(json!({"lcp": 1.2}))
        }

        async fn refresh(&self) -> Result<(), PageError> {
            Ok(())
        }

        fn page_url(&self) -> String {
            "http://localhost:3000/".to_owned()
        }
    }

    fn handlers(production: bool) -> CommandHandlers {
        CommandHandlers::new(FakePage::ok(), Arc::new(ConsoleRing::new()), production)
    }

    fn frame(raw: &str) -> Frame {
        Frame::parse(raw).expect("test frame")
    }

    #[tokio::test]
    async fn test_query_dom_returns_records() {
        let reply = handlers(false)
            .handle(&frame(r#"{"type":"query-dom","selector":"h1"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"]["count"], 1);
        assert_eq!(reply["data"]["results"][0]["tagName"], "H1");
        assert_eq!(reply["data"]["results"][0]["className"], "hero");
        assert_eq!(reply["data"]["results"][0]["textContent"], "Hello");
    }

    #[tokio::test]
    async fn test_query_dom_property_mode() {
        let reply = handlers(false)
            .handle(&frame(
                r#"{"type":"query-dom","selector":"h1","property":"href"}"#,
            ))
            .await
            .expect("command reply");
        assert_eq!(reply["data"]["results"][0], "value-of-href");
    }

    #[tokio::test]
    async fn test_query_dom_missing_selector_is_invalid() {
        let reply = handlers(false)
            .handle(&frame(r#"{"type":"query-dom"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn test_exec_js_rejected_in_production() {
        let reply = handlers(true)
            .handle(&frame(r#"{"type":"exec-js","code":"1+1"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "exec-js is disabled in production");
    }

    #[tokio::test]
    async fn test_exec_js_length_cap() {
        let long = "x".repeat(10_001);
        let raw = serde_json::to_string(&json!({"type": "exec-js", "code": long}))
            .expect("serialize");
        let reply = handlers(false)
            .handle(&frame(&raw))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], false);
    }

    #[tokio::test]
    async fn test_exec_js_error_becomes_failure_reply() {
        let reply = handlers(false)
            .handle(&frame(r#"{"type":"exec-js","code":"throw new Error()"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "boom");
    }

    #[tokio::test]
    async fn test_exec_js_result_passthrough() {
        let reply = handlers(false)
            .handle(&frame(r#"{"type":"exec-js","code":"21*2"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], true);
        assert_eq!(reply["data"], 42);
    }

    #[tokio::test]
    async fn test_request_screenshot_carries_request_id_and_defaults() {
        let reply = handlers(false)
            .handle(&frame(
                r#"{"type":"request-screenshot","requestId":"r-9"}"#,
            ))
            .await
            .expect("command reply");
        assert_eq!(reply["type"], "screenshot-response");
        assert_eq!(reply["requestId"], "r-9");
        assert_eq!(reply["success"], true);
        let data_url = reply["data"]["screenshot"].as_str().expect("data url");
        assert!(data_url.starts_with("data:image/jpeg"));
    }

    #[tokio::test]
    async fn test_get_logs_filters_ring() {
        let console = Arc::new(ConsoleRing::new());
        console.record(LogLevel::Error, "TypeError y", None);
        console.record(LogLevel::Log, "fine", None);
        let handlers = CommandHandlers::new(FakePage::ok(), console, false);

        let reply = handlers
            .handle(&frame(r#"{"type":"get-logs","level":"error"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["data"]["logs"].as_array().expect("logs").len(), 1);
        assert_eq!(reply["data"]["errorCount"], 1);
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let reply = handlers(false)
            .handle(&frame(r#"{"type":"server-info","appPort":3000}"#))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_screenshot_failure_is_reported() {
        let driver = Arc::new(FakePage { fail_capture: true });
        let handlers = CommandHandlers::new(driver, Arc::new(ConsoleRing::new()), false);
        let reply = handlers
            .handle(&frame(r#"{"type":"screenshot"}"#))
            .await
            .expect("command reply");
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "capture failed: canvas unavailable");
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        let text = "é".repeat(150);
        let clipped = clip(&text, 100);
        assert_eq!(clipped.chars().count(), 100);
    }
}
