//! Turns generation artifacts into files ready for upload.

use crate::error::{MediaError, Result};
use crate::format::{OutputFormat, sniff};
use crate::temp::TempResources;
use base64::Engine;
use bb_gen::{ArtifactSource, JobArtifact};
use std::path::PathBuf;
use std::time::Duration;

pub const ARTIFACT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest artifact we will download from a result URL.
pub const ARTIFACT_MAX_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedImage {
    pub path: PathBuf,
    /// Upload name, e.g. `imagine_2.png`.
    pub file_name: String,
    pub content_type: &'static str,
}

/// `{prefix}_{n}.{ext}` (1-based) when there are several outputs, otherwise
/// `{prefix}.{ext}`.
pub fn output_file_name(prefix: &str, index: usize, total: usize, format: OutputFormat) -> String {
    if total > 1 {
        format!("{prefix}_{}.{}", index + 1, format.extension())
    } else {
        format!("{prefix}.{}", format.extension())
    }
}

/// Strict base64 decode of an inline payload: an optional `data:` prefix and
/// any whitespace are stripped and missing padding is restored first.
pub fn decode_inline(data: &str) -> Result<Vec<u8>> {
    let payload = match data.trim().strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, b64)| b64)
            .ok_or_else(|| MediaError::Decode("data url without payload".to_string()))?,
        None => data,
    };
    let mut cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(MediaError::Decode("empty base64 payload".to_string()));
    }
    let missing = cleaned.len() % 4;
    if missing != 0 {
        cleaned.extend(std::iter::repeat_n('=', 4 - missing));
    }
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| MediaError::Decode(format!("invalid base64: {e}")))
}

#[derive(Clone)]
pub struct ArtifactMaterializer {
    http: reqwest::Client,
    max_bytes: u64,
}

impl Default for ArtifactMaterializer {
    fn default() -> Self {
        Self::new(ARTIFACT_DOWNLOAD_TIMEOUT, ARTIFACT_MAX_BYTES)
    }
}

impl ArtifactMaterializer {
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { http, max_bytes }
    }

    fn check_size(&self, url: &str, size: u64) -> Result<()> {
        if size > self.max_bytes {
            return Err(MediaError::Download(format!(
                "{url} is {size} bytes, above the {} byte limit",
                self.max_bytes
            )));
        }
        Ok(())
    }

    pub async fn fetch_bytes(&self, source: &ArtifactSource) -> Result<Vec<u8>> {
        match source {
            ArtifactSource::Inline { data } => decode_inline(data),
            ArtifactSource::Url { url } if url.starts_with("data:") => decode_inline(url),
            ArtifactSource::Url { url } => {
                let response = self.http.get(url).send().await?.error_for_status()?;
                if let Some(len) = response.content_length() {
                    self.check_size(url, len)?;
                }
                let bytes = response.bytes().await?;
                self.check_size(url, bytes.len() as u64)?;
                Ok(bytes.to_vec())
            }
        }
    }

    /// Decodes or downloads one artifact, converts it to `format` and writes
    /// it to a tracked file.
    pub async fn materialize(
        &self,
        artifact: &JobArtifact,
        format: OutputFormat,
        file_name: String,
        temp: &mut TempResources,
    ) -> Result<MaterializedImage> {
        let bytes = self.fetch_bytes(&artifact.source).await?;
        sniff(&bytes)?;
        let converted = tokio::task::spawn_blocking(move || format.convert(&bytes)).await??;
        let path = temp.write_tracked(format.extension(), &converted).await?;
        Ok(MaterializedImage {
            path,
            file_name,
            content_type: format.mime(),
        })
    }

    /// Materializes every artifact, dropping the ones that fail. The caller
    /// decides what an empty result means.
    pub async fn materialize_all(
        &self,
        artifacts: &[JobArtifact],
        format: OutputFormat,
        prefix: &str,
        temp: &mut TempResources,
    ) -> Vec<MaterializedImage> {
        let total = artifacts.len();
        let mut out = Vec::with_capacity(total);
        for (index, artifact) in artifacts.iter().enumerate() {
            let name = output_file_name(prefix, index, total, format);
            match self.materialize(artifact, format, name, temp).await {
                Ok(image) => out.push(image),
                Err(error) => {
                    tracing::warn!(index, %error, "dropping artifact that failed to materialize");
                }
            }
        }
        out
    }
}
