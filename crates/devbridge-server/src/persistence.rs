//! Artifact persistence for `save-*` commands.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use devbridge_core::SaveKind;
use devbridge_core::commands::ImageFormat;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from persisting an artifact.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The screenshot payload was not valid base64.
    #[error("invalid image data: {0}")]
    Decode(#[from] base64::DecodeError),
    /// The payload could not be serialized.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where `save-*` payloads end up.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `payload` and return the written path.
    async fn save(&self, kind: SaveKind, payload: &Value) -> Result<PathBuf, PersistError>;
}

/// Writes artifacts under `<root>/<kind>/`.
///
/// Screenshots carrying base64 image data (bare or as a `data:` URL) are
/// written as image files; everything else is written as pretty JSON.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    seq: AtomicU64,
}

impl FsArtifactStore {
    /// Store rooted at `root` (created on first save).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(&self, kind: SaveKind, ext: &str) -> String {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{stamp}-{n}.{ext}", kind.as_str())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(&self, kind: SaveKind, payload: &Value) -> Result<PathBuf, PersistError> {
        let dir = self.root.join(kind.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let image = if kind == SaveKind::Screenshot {
            image_data(payload)
        } else {
            None
        };

        let path = if let Some((format, encoded)) = image {
            let bytes = STANDARD.decode(encoded.trim())?;
            let path = dir.join(self.file_name(kind, format.extension()));
            tokio::fs::write(&path, bytes).await?;
            path
        } else {
            let body = serde_json::to_vec_pretty(payload)?;
            let path = dir.join(self.file_name(kind, "json"));
            tokio::fs::write(&path, body).await?;
            path
        };

        debug!(kind = kind.as_str(), path = %path.display(), "artifact saved");
        Ok(path)
    }
}

/// Locate base64 image data in a screenshot payload.
///
/// Accepts a bare string, or an object carrying it under `screenshot`,
/// `image`, or `dataUrl`. A `data:image/<fmt>;base64,` prefix selects the
/// format; otherwise `format` (if present) or PNG.
fn image_data(payload: &Value) -> Option<(ImageFormat, &str)> {
    let raw = match payload {
        Value::String(s) => s.as_str(),
        Value::Object(map) => ["screenshot", "image", "dataUrl"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))?,
        _ => return None,
    };

    if let Some(rest) = raw.strip_prefix("data:") {
        let (meta, encoded) = rest.split_once(',')?;
        let mime = meta.strip_suffix(";base64")?;
        let format = match mime {
            "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
            "image/webp" => ImageFormat::Webp,
            _ => ImageFormat::Png,
        };
        return Some((format, encoded));
    }

    let format = payload
        .get("format")
        .cloned()
        .and_then(|f| serde_json::from_value(f).ok())
        .unwrap_or_default();
    Some((format, raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const PNG_MAGIC_B64: &str = "iVBORw0KGgo=";

    #[test]
    fn image_data_from_data_url() {
        let payload = json!({"screenshot": "data:image/jpeg;base64,AAAA"});
        let (format, encoded) = image_data(&payload).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
        assert_eq!(encoded, "AAAA");
    }

    #[test]
    fn image_data_bare_string_defaults_to_png() {
        let payload = json!("AAAA");
        assert_eq!(image_data(&payload).unwrap().0, ImageFormat::Png);
    }

    #[test]
    fn image_data_uses_format_field() {
        let payload = json!({"image": "AAAA", "format": "webp"});
        assert_eq!(image_data(&payload).unwrap().0, ImageFormat::Webp);
    }

    #[test]
    fn image_data_absent() {
        assert!(image_data(&json!({"nodes": []})).is_none());
        assert!(image_data(&json!(42)).is_none());
    }

    #[tokio::test]
    async fn screenshot_written_as_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let payload = json!({"screenshot": format!("data:image/png;base64,{PNG_MAGIC_B64}")});

        let path = store.save(SaveKind::Screenshot, &payload).await.unwrap();
        assert!(path.starts_with(dir.path().join("screenshot")));
        assert_eq!(path.extension().unwrap(), "png");
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[tokio::test]
    async fn outline_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let payload = json!({"headings": ["Intro"]});

        let path = store.save(SaveKind::Outline, &payload).await.unwrap();
        assert_eq!(path.extension().unwrap(), "json");
        let back: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn consecutive_saves_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let a = store.save(SaveKind::Logs, &json!([])).await.unwrap();
        let b = store.save(SaveKind::Logs, &json!([])).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn invalid_base64_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let result = store
            .save(SaveKind::Screenshot, &json!({"screenshot": "not base64!!"}))
            .await;
        assert_matches!(result, Err(PersistError::Decode(_)));
    }
}
