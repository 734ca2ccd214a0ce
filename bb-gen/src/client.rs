use crate::error::{GenError, Result};
use crate::types::GenerationRequest;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Degraded,
    Unhealthy,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub status: ProbeStatus,
    pub message: String,
}

impl ProbeReport {
    pub fn new(status: ProbeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// A single outbound call to the generation API, no retries.
#[async_trait]
pub trait GenerationTransport: Send + Sync {
    async fn send(&self, request: &GenerationRequest) -> Result<serde_json::Value>;

    /// Cheap reachability and credential check. Never generates anything.
    async fn probe(&self) -> ProbeReport {
        ProbeReport::new(ProbeStatus::Ok, "transport has no remote endpoint")
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub api_key: String,
    pub referer: String,
    pub title: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(options: ClientOptions) -> Result<Self> {
        if options.api_key.trim().is_empty() {
            return Err(GenError::InvalidInput("api key is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            api_key: options.api_key,
            referer: options.referer,
            title: options.title,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }
}

#[async_trait]
impl GenerationTransport for OpenRouterClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %request.model))]
    async fn send(&self, request: &GenerationRequest) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn probe(&self) -> ProbeReport {
        let response = self
            .http
            .get(self.models_url())
            .bearer_auth(&self.api_key)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let report = match response {
            Ok(r) if r.status().is_success() => ProbeReport::new(ProbeStatus::Ok, "api key valid"),
            Ok(r) if r.status().as_u16() == 401 => {
                ProbeReport::new(ProbeStatus::Unhealthy, "invalid api key")
            }
            Ok(r) => ProbeReport::new(
                ProbeStatus::Degraded,
                format!("api returned {}", r.status().as_u16()),
            ),
            Err(e) => ProbeReport::new(ProbeStatus::Unhealthy, e.to_string()),
        };
        tracing::debug!(status = report.status.as_str(), message = %report.message, "generation api probe");
        report
    }
}
