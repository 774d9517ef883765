//! Artifact persistence under the project root.
//!
//! All artifacts live beneath `<root>/.tmp/sweetlink-*`; persistent state
//! lives at `<root>/.sweetlink/`. The root is captured once at server start,
//! so later working-directory changes do not move the layout.
//!
//! Per-artifact filenames carry an ISO-8601 timestamp at millisecond
//! resolution with `:` and `.` replaced by `-`. Writes are whole-file; the
//! store does not serialise concurrent writers because the timestamped names
//! keep them apart. `settings.json` is the one stable, overwrite-only path.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{
    A11yPayload, ConsoleLogsPayload, OutlinePayload, SchemaPayload, ScreenshotPayload,
};
use crate::types::DevbarSettings;

const SCREENSHOTS_DIR: &str = ".tmp/sweetlink-screenshots";
const DESIGN_REVIEWS_DIR: &str = ".tmp/sweetlink-design-reviews";
const OUTLINES_DIR: &str = ".tmp/sweetlink-outlines";
const SCHEMAS_DIR: &str = ".tmp/sweetlink-schemas";
const LOGS_DIR: &str = ".tmp/sweetlink-logs";
const A11Y_DIR: &str = ".tmp/sweetlink-a11y";
const STATE_DIR: &str = ".sweetlink";
const SETTINGS_FILE: &str = "settings.json";

/// Errors raised by artifact persistence.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Directory creation failed.
    #[error("failed to create directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A whole-file write failed.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A read failed for a reason other than the file being absent.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The screenshot payload did not decode as base64.
    #[error("invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),
    /// Settings JSON failed to serialise or parse.
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Paths produced by a screenshot save: the image plus its JSON sidecar.
#[derive(Debug, Clone)]
pub struct SavedScreenshot {
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Paths produced by a design-review save.
#[derive(Debug, Clone)]
pub struct SavedReview {
    pub screenshot_path: PathBuf,
    pub review_path: PathBuf,
}

/// Writes typed artifacts to well-known paths beneath a project root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create a store rooted at `root`. A relative root is resolved against
    /// the current working directory so that returned paths are absolute.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        Self { root }
    }

    /// The project root all artifacts live beneath.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a screenshot with its metadata sidecar.
    ///
    /// The base64 image (optionally a `data:image/...;base64,` URL) is
    /// decoded and written as `screenshot-<stamp>.png` or `.jpg`; the
    /// remaining payload fields land in `screenshot-<stamp>.json`.
    pub async fn save_screenshot(
        &self,
        payload: &ScreenshotPayload,
    ) -> Result<SavedScreenshot, PersistError> {
        let dir = self.ensure_dir(SCREENSHOTS_DIR).await?;
        let stamp = timestamp_slug();
        let (bytes, ext) = decode_image(&payload.screenshot)?;

        let image_path = dir.join(format!("screenshot-{stamp}.{ext}"));
        write_file(&image_path, &bytes).await?;

        let metadata_path = dir.join(format!("screenshot-{stamp}.json"));
        let metadata = json!({
            "url": payload.url,
            "timestamp": payload.timestamp,
            "dimensions": payload.dimensions,
            "logs": payload.logs,
            "webVitals": payload.web_vitals,
            "pageSize": payload.page_size,
        });
        write_file(&metadata_path, &serde_json::to_vec_pretty(&metadata)?).await?;

        debug!(path = %image_path.display(), "screenshot persisted");
        Ok(SavedScreenshot {
            image_path,
            metadata_path,
        })
    }

    /// Persist a design-review pair: the screenshot under review and the
    /// review text produced by the external reviewer.
    pub async fn save_design_review(
        &self,
        payload: &ScreenshotPayload,
        review: &str,
    ) -> Result<SavedReview, PersistError> {
        let dir = self.ensure_dir(DESIGN_REVIEWS_DIR).await?;
        let stamp = timestamp_slug();
        let (bytes, ext) = decode_image(&payload.screenshot)?;

        let screenshot_path = dir.join(format!("screenshot-{stamp}.{ext}"));
        write_file(&screenshot_path, &bytes).await?;

        let review_path = dir.join(format!("review-{stamp}.md"));
        write_file(&review_path, review.as_bytes()).await?;

        debug!(path = %review_path.display(), "design review persisted");
        Ok(SavedReview {
            screenshot_path,
            review_path,
        })
    }

    /// Persist a pre-rendered outline document.
    pub async fn save_outline(&self, payload: &OutlinePayload) -> Result<PathBuf, PersistError> {
        self.save_markdown(OUTLINES_DIR, "outline", &payload.markdown)
            .await
    }

    /// Persist a pre-rendered schema document.
    pub async fn save_schema(&self, payload: &SchemaPayload) -> Result<PathBuf, PersistError> {
        self.save_markdown(SCHEMAS_DIR, "schema", &payload.markdown)
            .await
    }

    /// Persist a console-log dump.
    pub async fn save_console_logs(
        &self,
        payload: &ConsoleLogsPayload,
    ) -> Result<PathBuf, PersistError> {
        self.save_markdown(LOGS_DIR, "console-logs", &payload.markdown)
            .await
    }

    /// Persist an accessibility report.
    pub async fn save_a11y(&self, payload: &A11yPayload) -> Result<PathBuf, PersistError> {
        self.save_markdown(A11Y_DIR, "a11y", &payload.markdown).await
    }

    /// Overwrite `settings.json` with the given settings.
    pub async fn save_settings(
        &self,
        settings: &DevbarSettings,
    ) -> Result<PathBuf, PersistError> {
        let dir = self.ensure_dir(STATE_DIR).await?;
        let path = dir.join(SETTINGS_FILE);
        write_file(&path, &serde_json::to_vec_pretty(settings)?).await?;
        debug!(path = %path.display(), "settings persisted");
        Ok(path)
    }

    /// Read `settings.json`. A missing file is not an error: defaults are
    /// returned instead.
    pub async fn load_settings(&self) -> Result<DevbarSettings, PersistError> {
        let path = self.root.join(STATE_DIR).join(SETTINGS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(DevbarSettings::default())
            }
            Err(source) => Err(PersistError::Read { path, source }),
        }
    }

    async fn save_markdown(
        &self,
        dir: &str,
        prefix: &str,
        markdown: &str,
    ) -> Result<PathBuf, PersistError> {
        let dir = self.ensure_dir(dir).await?;
        let path = dir.join(format!("{prefix}-{}.md", timestamp_slug()));
        write_file(&path, markdown.as_bytes()).await?;
        debug!(path = %path.display(), "artifact persisted");
        Ok(path)
    }

    async fn ensure_dir(&self, rel: &str) -> Result<PathBuf, PersistError> {
        let dir = self.root.join(rel);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PersistError::CreateDir {
                dir: dir.clone(),
                source,
            })?;
        Ok(dir)
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| PersistError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// ISO-8601 wall-clock stamp at millisecond resolution, filename-safe:
/// `:` and `.` become `-` (e.g. `2025-03-01T09-30-12-345Z`).
#[must_use]
pub fn timestamp_slug() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

/// Strip an optional data-URL prefix and decode the base64 body.
///
/// The extension is taken from the declared MIME type; anything that is not
/// JPEG is stored as PNG.
fn decode_image(data: &str) -> Result<(Vec<u8>, &'static str), PersistError> {
    let (body, ext) = match data.split_once(";base64,") {
        Some((header, body)) => {
            let ext = if header.contains("image/jpeg") || header.contains("image/jpg") {
                "jpg"
            } else {
                "png"
            };
            (body, ext)
        }
        None => (data, "png"),
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(body.trim())?;
    Ok((bytes, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UiMode;

    // 1x1 transparent PNG.
    const TINY_PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    fn screenshot_payload(data: &str) -> ScreenshotPayload {
        ScreenshotPayload {
            screenshot: data.to_owned(),
            url: Some("http://localhost:3000/".to_owned()),
            timestamp: Some(1_700_000_000_000),
            dimensions: Some(crate::types::Dimensions {
                width: 1,
                height: 1,
            }),
            logs: vec![],
            web_vitals: None,
            page_size: None,
        }
    }

    #[test]
    fn test_timestamp_slug_is_filename_safe() {
        let slug = timestamp_slug();
        assert!(!slug.contains(':'));
        assert!(!slug.contains('.'));
        assert!(slug.ends_with('Z'));
        assert!(slug.contains('T'));
    }

    #[test]
    fn test_decode_image_plain_base64() {
        let (bytes, ext) = decode_image(TINY_PNG_B64).expect("decode");
        assert_eq!(ext, "png");
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn test_decode_image_data_url() {
        let url = format!("data:image/jpeg;base64,{TINY_PNG_B64}");
        let (_, ext) = decode_image(&url).expect("decode");
        assert_eq!(ext, "jpg");

        let url = format!("data:image/png;base64,{TINY_PNG_B64}");
        let (_, ext) = decode_image(&url).expect("decode");
        assert_eq!(ext, "png");
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(decode_image("!!not base64!!").is_err());
    }

    #[tokio::test]
    async fn test_save_screenshot_writes_image_and_sidecar() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let saved = store
            .save_screenshot(&screenshot_payload(TINY_PNG_B64))
            .await
            .expect("save");

        assert!(saved.image_path.is_absolute());
        let name = saved
            .image_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert!(name.starts_with("screenshot-"));
        assert!(name.ends_with(".png"));

        let bytes = std::fs::read(&saved.image_path).expect("read image");
        assert_eq!(&bytes[1..4], b"PNG");

        let meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(&saved.metadata_path).expect("read sidecar"),
        )
        .expect("sidecar JSON");
        assert_eq!(meta["url"], "http://localhost:3000/");
        assert_eq!(meta["dimensions"]["width"], 1);
    }

    #[tokio::test]
    async fn test_save_design_review_pairs_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let saved = store
            .save_design_review(&screenshot_payload(TINY_PNG_B64), "# Review\n\nLooks fine.")
            .await
            .expect("save");

        let review = std::fs::read_to_string(&saved.review_path).expect("read review");
        assert!(review.starts_with("# Review"));
        assert!(saved
            .review_path
            .to_string_lossy()
            .contains("sweetlink-design-reviews"));
        assert!(saved.screenshot_path.exists());
    }

    #[tokio::test]
    async fn test_save_markdown_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let outline = store
            .save_outline(&OutlinePayload {
                outline: serde_json::json!([]),
                markdown: "# Outline".to_owned(),
                url: None,
                title: None,
            })
            .await
            .expect("outline");
        assert!(outline.to_string_lossy().contains("sweetlink-outlines"));

        let schema = store
            .save_schema(&SchemaPayload {
                schemas: serde_json::json!({}),
                markdown: "# Schema".to_owned(),
                url: None,
                title: None,
            })
            .await
            .expect("schema");
        assert!(schema.to_string_lossy().contains("sweetlink-schemas"));

        let logs = store
            .save_console_logs(&ConsoleLogsPayload {
                logs: vec![],
                markdown: "# Logs".to_owned(),
            })
            .await
            .expect("logs");
        assert!(logs.to_string_lossy().contains("sweetlink-logs"));

        let a11y = store
            .save_a11y(&A11yPayload {
                markdown: "# A11y".to_owned(),
                url: None,
                title: None,
            })
            .await
            .expect("a11y");
        assert!(a11y.to_string_lossy().contains("sweetlink-a11y"));
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let mut settings = DevbarSettings::default();
        settings.mode = UiMode::Expanded;
        settings.hmr_screenshots = true;

        let path = store.save_settings(&settings).await.expect("save");
        assert!(path.ends_with(".sweetlink/settings.json"));

        let loaded = store.load_settings().await.expect("load");
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn test_load_settings_missing_returns_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let loaded = store.load_settings().await.expect("load");
        assert_eq!(loaded, DevbarSettings::default());
    }

    #[tokio::test]
    async fn test_save_settings_overwrites_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(tmp.path());

        let first = store
            .save_settings(&DevbarSettings::default())
            .await
            .expect("save");
        let mut changed = DevbarSettings::default();
        changed.notifications = true;
        let second = store.save_settings(&changed).await.expect("save again");

        assert_eq!(first, second);
        let loaded = store.load_settings().await.expect("load");
        assert!(loaded.notifications);
    }
}
