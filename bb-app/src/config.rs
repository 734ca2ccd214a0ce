//! Bananabot configuration loader.
//!
//! TOML file, then `.env`, then process environment, then validation.

use crate::admission::{CommandLimit, LimitTable};
use bb_gen::{ClientOptions, DEFAULT_BASE_URL, RetryPolicy};
use bb_media::ImageLimits;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub api: ApiConfig,
    pub discord: DiscordConfig,
    pub rate_limits: RateLimitsConfig,
    pub images: ImagesConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub referer: String,
    pub title: String,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub backoff_unit_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "google/gemini-2.5-flash-image-preview".to_string(),
            api_key: String::new(),
            referer: "https://github.com/bananabot".to_string(),
            title: "Bananabot".to_string(),
            max_retries: 3,
            timeout_seconds: 60,
            backoff_unit_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub enabled: bool,
    pub bot_token: String,
    /// In guild channels, only react to messages that mention the bot.
    pub require_mention: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default_limit: u32,
    pub default_window_seconds: u64,
    pub commands: HashMap<String, CommandLimit>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            "imagine".to_string(),
            CommandLimit {
                limit: 5,
                window_seconds: 300,
            },
        );
        commands.insert(
            "blend".to_string(),
            CommandLimit {
                limit: 15,
                window_seconds: 60,
            },
        );
        Self {
            default_limit: 10,
            default_window_seconds: 60,
            commands,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub allowed_types: Vec<String>,
    pub max_image_mb: f64,
    pub api_max_image_mb: f64,
    pub min_dimension: u32,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            allowed_types: ["png", "jpg", "jpeg", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_image_mb: 10.0,
            api_max_image_mb: 8.0,
            min_dimension: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
    pub retention_hours: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache"),
            retention_hours: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 0 disables the job timeout.
    pub job_timeout_seconds: u64,
    pub progress_step_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_timeout_seconds: 600,
            progress_step_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:8089".to_string(),
        }
    }
}

impl BotConfig {
    /// Loads `path`, or the default path when `None`. A missing default file
    /// means built-in defaults; a missing explicit file is an error.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::info!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(%e, "failed to load .env");
            }
        }
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies environment overrides read through `lookup`. Blank values are
    /// ignored.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("OPENROUTER_API_KEY") {
            self.api.api_key = v;
        }
        if let Some(v) = var("OPENROUTER_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = var("MODEL_ID") {
            self.api.model = v;
        }
        if let Some(v) = var("MAX_RETRIES") {
            self.api.max_retries = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("MAX_RETRIES={v:?}: {e}"))?;
        }
        if let Some(v) = var("TIMEOUT") {
            self.api.timeout_seconds = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("TIMEOUT={v:?}: {e}"))?;
        }
        if let Some(v) = var("DISCORD_TOKEN") {
            self.discord.bot_token = v;
            self.discord.enabled = true;
        }
        if let Some(v) = var("CACHE_DIR") {
            self.storage.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = var("RETENTION_HOURS") {
            self.storage.retention_hours = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("RETENTION_HOURS={v:?}: {e}"))?;
        }
        if let Some(v) = var("MAX_IMAGE_MB") {
            self.images.max_image_mb = v
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("MAX_IMAGE_MB={v:?}: {e}"))?;
        }
        if let Some(v) = var("ALLOWED_IMAGE_TYPES") {
            self.images.allowed_types = v
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.model.trim().is_empty() {
            return Err(anyhow::anyhow!("api.model is required"));
        }
        if !(self.api.base_url.starts_with("https://") || self.api.base_url.starts_with("http://"))
        {
            return Err(anyhow::anyhow!("api.base_url must be an http(s) url"));
        }
        if self.api.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("api.timeout_seconds must be > 0"));
        }
        if self.discord.enabled && self.discord.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "discord.bot_token is required when discord is enabled"
            ));
        }
        if self.rate_limits.default_limit == 0 || self.rate_limits.default_window_seconds == 0 {
            return Err(anyhow::anyhow!(
                "rate_limits.default_limit and default_window_seconds must be > 0"
            ));
        }
        for (name, limit) in &self.rate_limits.commands {
            if limit.limit == 0 || limit.window_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "rate_limits.commands.{name}: limit and window_seconds must be > 0"
                ));
            }
        }
        if self.images.allowed_types.is_empty() {
            return Err(anyhow::anyhow!("images.allowed_types must not be empty"));
        }
        let positive = |mb: f64| mb.is_finite() && mb > 0.0;
        if !positive(self.images.max_image_mb) || !positive(self.images.api_max_image_mb) {
            return Err(anyhow::anyhow!(
                "images.max_image_mb and api_max_image_mb must be > 0"
            ));
        }
        if self.storage.retention_hours < 0.0 || !self.storage.retention_hours.is_finite() {
            return Err(anyhow::anyhow!("storage.retention_hours must be >= 0"));
        }
        if self.server.enabled && self.server.bind_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bind_addr is required"));
        }
        Ok(())
    }

    pub fn command_limit(&self, command: &str) -> CommandLimit {
        self.limit_table().get(command)
    }

    pub fn limit_table(&self) -> LimitTable {
        LimitTable {
            default: CommandLimit {
                limit: self.rate_limits.default_limit,
                window_seconds: self.rate_limits.default_window_seconds,
            },
            overrides: self.rate_limits.commands.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.api.max_retries,
            backoff_unit: Duration::from_millis(self.api.backoff_unit_ms),
        }
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits::from_megabytes(
            self.images.allowed_types.clone(),
            self.images.max_image_mb,
            self.images.api_max_image_mb,
            self.images.min_dimension,
        )
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.api.base_url.clone(),
            api_key: self.api.api_key.clone(),
            referer: self.api.referer.clone(),
            title: self.api.title.clone(),
            timeout: Duration::from_secs(self.api.timeout_seconds),
        }
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.queue.job_timeout_seconds > 0)
            .then(|| Duration::from_secs(self.queue.job_timeout_seconds))
    }

    pub fn progress_step_delay(&self) -> Duration {
        Duration::from_millis(self.queue.progress_step_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs_f64(self.storage.retention_hours * 3600.0)
    }

    /// Per-job scratch files live under the cache dir.
    pub fn jobs_dir(&self) -> PathBuf {
        self.storage.cache_dir.join("jobs")
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".bananabot").join("config.toml")
}
