//! Source images for edit and blend jobs.
//!
//! Every way a user can hand us an image collapses into [`ImageSource`] at
//! ingestion, and [`SourceResolver::resolve`] turns any of them into a file on
//! disk with a sniffed format.

use crate::error::{MediaError, Result};
use crate::format::{extension_of, mime_of, sniff};
use crate::temp::TempResources;
use base64::Engine;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Already on disk and not owned by the job; never deleted.
    LocalPath { path: PathBuf },
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    Inline { mime: String, data_base64: String },
}

impl ImageSource {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url {
            url: url.into(),
            filename: None,
            content_type: None,
            size: None,
        }
    }

    /// Short human label for logs and error messages.
    pub fn label(&self) -> String {
        match self {
            Self::LocalPath { path } => path.display().to_string(),
            Self::Url { url, filename, .. } => filename.clone().unwrap_or_else(|| url.clone()),
            Self::Inline { mime, .. } => format!("inline {mime}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageLimits {
    /// Lowercase extensions without the dot.
    pub allowed_types: Vec<String>,
    pub max_bytes: u64,
    /// Payload ceiling for images sent to the API; larger sources are downscaled.
    pub api_max_bytes: u64,
    pub min_dimension: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self::from_megabytes(
            ["png", "jpg", "jpeg", "webp"].iter().map(|s| s.to_string()).collect(),
            10.0,
            8.0,
            64,
        )
    }
}

impl ImageLimits {
    pub fn from_megabytes(
        allowed_types: Vec<String>,
        max_image_mb: f64,
        api_max_image_mb: f64,
        min_dimension: u32,
    ) -> Self {
        Self {
            allowed_types: allowed_types
                .into_iter()
                .map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            max_bytes: (max_image_mb.max(0.0) * BYTES_PER_MB) as u64,
            api_max_bytes: (api_max_image_mb.max(0.0) * BYTES_PER_MB) as u64,
            min_dimension,
        }
    }

    pub fn allows_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        let aliases: &[&str] = match ext.as_str() {
            "jpg" | "jpeg" => &["jpg", "jpeg"],
            other => return self.allowed_types.iter().any(|t| t == other),
        };
        self.allowed_types.iter().any(|t| aliases.contains(&t.as_str()))
    }

    fn check_size(&self, label: &str, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(MediaError::Validation(format!(
                "{label} is {size} bytes, above the {} byte limit",
                self.max_bytes
            )));
        }
        Ok(())
    }

    fn check_extension(&self, label: &str, ext: &str) -> Result<()> {
        if !self.allows_extension(ext) {
            return Err(MediaError::Validation(format!(
                "{label}: type {ext} is not allowed (allowed: {})",
                self.allowed_types.join(", ")
            )));
        }
        Ok(())
    }

    /// Checks what is known about a source before fetching anything.
    pub fn validate_declared(&self, source: &ImageSource) -> Result<()> {
        let label = source.label();
        match source {
            ImageSource::LocalPath { path } => {
                if let Some(ext) = extension(path) {
                    self.check_extension(&label, &ext)?;
                }
            }
            ImageSource::Url {
                url,
                filename,
                content_type,
                size,
            } => {
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(MediaError::Validation(format!("{label}: not an http(s) url")));
                }
                let declared_image = content_type
                    .as_deref()
                    .is_none_or(|ct| ct.to_ascii_lowercase().starts_with("image/"));
                if !declared_image {
                    return Err(MediaError::Validation(format!("{label} is not an image")));
                }
                let declared_ext = filename
                    .as_deref()
                    .and_then(|f| extension(Path::new(f)))
                    .or_else(|| url_extension(url));
                if let Some(ext) = declared_ext {
                    self.check_extension(&label, &ext)?;
                }
                if let Some(size) = size {
                    self.check_size(&label, *size)?;
                }
            }
            ImageSource::Inline { mime, .. } => {
                let mime = mime.to_ascii_lowercase();
                let Some(subtype) = mime.strip_prefix("image/") else {
                    return Err(MediaError::Validation(format!("{label} is not an image")));
                };
                self.check_extension(&label, subtype)?;
            }
        }
        Ok(())
    }

    /// Checks the fetched bytes themselves: size ceiling and a recognised,
    /// allowed image header.
    pub fn validate_bytes(&self, label: &str, bytes: &[u8]) -> Result<ImageFormat> {
        self.check_size(label, bytes.len() as u64)?;
        let format = sniff(bytes)
            .map_err(|_| MediaError::Validation(format!("{label} is not a readable image")))?;
        self.check_extension(label, extension_of(format))?;
        Ok(format)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?.to_string();
    extension(Path::new(&last))
}

/// A source that now lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub format: ImageFormat,
}

impl ResolvedImage {
    pub fn mime(&self) -> &'static str {
        mime_of(self.format)
    }
}

#[derive(Clone)]
pub struct SourceResolver {
    http: reqwest::Client,
    limits: ImageLimits,
}

impl SourceResolver {
    pub fn new(limits: ImageLimits, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http, limits }
    }

    pub fn limits(&self) -> &ImageLimits {
        &self.limits
    }

    /// Downloads, decodes or opens `source` and validates the resulting bytes.
    /// Anything written to disk is tracked by `temp`.
    #[tracing::instrument(level = "debug", skip_all, fields(source = %source.label()))]
    pub async fn resolve(&self, source: &ImageSource, temp: &mut TempResources) -> Result<ResolvedImage> {
        self.limits.validate_declared(source)?;
        let label = source.label();
        match source {
            ImageSource::LocalPath { path } => {
                let bytes = tokio::fs::read(path).await?;
                let format = self.limits.validate_bytes(&label, &bytes)?;
                Ok(ResolvedImage {
                    path: path.clone(),
                    format,
                })
            }
            ImageSource::Url { url, .. } => {
                let bytes = self.download(url).await?;
                self.store(&label, &bytes, temp).await
            }
            ImageSource::Inline { data_base64, .. } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data_base64.trim())
                    .map_err(|e| MediaError::Validation(format!("{label}: invalid base64: {e}")))?;
                self.store(&label, &bytes, temp).await
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        if let Some(len) = response.content_length() {
            self.limits.check_size(url, len)?;
        }
        let bytes = response.bytes().await?;
        self.limits.check_size(url, bytes.len() as u64)?;
        tracing::debug!(bytes = bytes.len(), "source downloaded");
        Ok(bytes.to_vec())
    }

    async fn store(&self, label: &str, bytes: &[u8], temp: &mut TempResources) -> Result<ResolvedImage> {
        let format = self.limits.validate_bytes(label, bytes)?;
        let path = temp.write_tracked(extension_of(format), bytes).await?;
        Ok(ResolvedImage { path, format })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::noisy_png;
    use axum::Router;
    use axum::routing::get;

    fn resolver() -> SourceResolver {
        SourceResolver::new(ImageLimits::default(), Duration::from_secs(5))
    }

    #[test]
    fn declared_validation_rejects_wrong_type_extension_and_size() {
        let limits = ImageLimits::default();

        let not_image = ImageSource::Url {
            url: "https://cdn.test/a.png".to_string(),
            filename: Some("a.png".to_string()),
            content_type: Some("text/plain".to_string()),
            size: Some(10),
        };
        assert!(limits.validate_declared(&not_image).is_err());

        let gif = ImageSource::url("https://cdn.test/anim.gif?x=1");
        assert!(limits.validate_declared(&gif).is_err());

        let huge = ImageSource::Url {
            url: "https://cdn.test/a.jpeg".to_string(),
            filename: None,
            content_type: Some("image/jpeg".to_string()),
            size: Some(limits.max_bytes + 1),
        };
        assert!(limits.validate_declared(&huge).is_err());

        let ok = ImageSource::url("https://cdn.test/photo.JPG");
        limits.validate_declared(&ok).expect("jpg allowed");
    }

    #[test]
    fn jpg_and_jpeg_are_interchangeable() {
        let limits = ImageLimits::from_megabytes(vec!["jpeg".to_string()], 1.0, 1.0, 64);
        assert!(limits.allows_extension("jpg"));
        assert!(limits.allows_extension(".JPEG"));
        assert!(!limits.allows_extension("png"));
    }

    #[test]
    fn sources_round_trip_through_serde() {
        let source = ImageSource::Inline {
            mime: "image/png".to_string(),
            data_base64: "AAAA".to_string(),
        };
        let v = serde_json::to_value(&source).expect("serialize");
        assert_eq!(v["kind"], "inline");
        let back: ImageSource = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, source);
    }

    #[tokio::test]
    async fn inline_source_is_written_to_a_tracked_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut temp = TempResources::new(dir.path());
        let png = noisy_png(8, 8);
        let source = ImageSource::Inline {
            mime: "image/png".to_string(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(&png),
        };

        let resolved = resolver().resolve(&source, &mut temp).await.expect("resolve");

        assert_eq!(resolved.format, ImageFormat::Png);
        assert_eq!(resolved.mime(), "image/png");
        assert_eq!(temp.tracked(), &[resolved.path.clone()]);
        assert_eq!(std::fs::read(&resolved.path).expect("read"), png);
    }

    #[tokio::test]
    async fn local_path_is_used_in_place_and_not_tracked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("source.png");
        std::fs::write(&path, noisy_png(8, 8)).expect("write");
        let mut temp = TempResources::new(dir.path().join("job"));

        let resolved = resolver()
            .resolve(&ImageSource::LocalPath { path: path.clone() }, &mut temp)
            .await
            .expect("resolve");
        temp.release_all();

        assert_eq!(resolved.path, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn inline_bytes_that_are_not_an_image_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut temp = TempResources::new(dir.path());
        let source = ImageSource::Inline {
            mime: "image/png".to_string(),
            data_base64: base64::engine::general_purpose::STANDARD.encode(b"not an image"),
        };
        let err = resolver().resolve(&source, &mut temp).await.expect_err("rejected");
        assert!(matches!(err, MediaError::Validation(_)));
        assert!(temp.is_empty());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn url_sources_are_downloaded_and_checked() {
        let router = Router::new()
            .route("/photo.png", get(|| async { noisy_png(8, 8) }))
            .route("/huge.png", get(|| async { vec![0u8; 8192] }))
            .route("/page.png", get(|| async { "<html>not an image</html>" }));
        let base = serve(router).await;
        let limits = ImageLimits {
            max_bytes: 4096,
            ..ImageLimits::default()
        };
        let resolver = SourceResolver::new(limits, Duration::from_secs(5));
        let dir = tempfile::tempdir().expect("tempdir");
        let mut temp = TempResources::new(dir.path());

        let resolved = resolver
            .resolve(&ImageSource::url(format!("{base}/photo.png")), &mut temp)
            .await
            .expect("resolve");
        assert_eq!(resolved.format, ImageFormat::Png);
        assert_eq!(temp.tracked(), &[resolved.path.clone()]);

        let err = resolver
            .resolve(&ImageSource::url(format!("{base}/huge.png")), &mut temp)
            .await
            .expect_err("too large");
        assert!(matches!(err, MediaError::Validation(_)));
        assert!(err.to_string().contains("8192 bytes"));

        let err = resolver
            .resolve(&ImageSource::url(format!("{base}/page.png")), &mut temp)
            .await
            .expect_err("not an image");
        assert!(matches!(err, MediaError::Validation(_)));
        assert!(err.to_string().contains("not a readable image"));

        assert_eq!(temp.tracked().len(), 1);
    }
}
