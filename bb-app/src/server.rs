//! Bananabot server: wires the job pipeline, channel adapters, gateway,
//! maintenance and the admin HTTP surface together.

use crate::admission::AdmissionController;
use crate::config::BotConfig;
use crate::followup::FollowUpRegistry;
use crate::gateway::Gateway;
use crate::handlers::ImageJobProcessor;
use crate::maintenance::{MAINTENANCE_INTERVAL, Maintenance};
use crate::preferences::PreferenceStore;
use crate::queue::{JobSender, WorkerOptions, job_queue};
use crate::routes;
use crate::storage::check_cache_writable;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use bb_channels::{ChannelAdapter, DiscordAdapter};
use bb_gen::{GenerationTransport, OpenRouterClient, ProbeStatus, ResilientDispatcher};
use bb_media::{ArtifactMaterializer, SourceResolver};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const HTTP_MAX_IN_FLIGHT: usize = 64;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SOURCE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const INBOUND_BUFFER: usize = 256;

/// Read-only view of the running bot for the admin routes.
pub struct AppState {
    pub started_at: Instant,
    pub jobs: JobSender,
    pub admission: Arc<AdmissionController>,
    pub followups: Arc<FollowUpRegistry>,
    pub channels: Vec<String>,
    /// Checked by the deep health route.
    pub api: Arc<dyn GenerationTransport>,
    pub cache_dir: PathBuf,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = BotConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.api.model,
        base_url = %cfg.api.base_url,
        api_key_configured = !cfg.api.api_key.is_empty(),
        discord_enabled = cfg.discord.enabled,
        cache_dir = %cfg.storage.cache_dir.display(),
        retention_hours = cfg.storage.retention_hours,
        server_enabled = cfg.server.enabled,
        bind_addr = %cfg.server.bind_addr,
        config_path = %path.display(),
        "config ok"
    );

    let storage = check_cache_writable(&cfg.storage.cache_dir).await;
    tracing::info!(status = storage.status.as_str(), message = %storage.message, "cache storage check");
    if storage.status == ProbeStatus::Unhealthy {
        return Err(anyhow::anyhow!("cache storage check failed: {}", storage.message));
    }

    if cfg.api.api_key.trim().is_empty() {
        tracing::warn!("no api key configured; skipping generation api check");
        return Ok(());
    }
    let client = OpenRouterClient::new(cfg.client_options())
        .map_err(|e| anyhow::anyhow!("generation client: {e}"))?;
    let api = client.probe().await;
    match api.status {
        ProbeStatus::Ok => tracing::info!(message = %api.message, "generation api check passed"),
        ProbeStatus::Degraded => tracing::warn!(message = %api.message, "generation api degraded"),
        ProbeStatus::Unhealthy => {
            return Err(anyhow::anyhow!("generation api check failed: {}", api.message));
        }
    }
    Ok(())
}

/// Prints the effective admission limit for every known command.
pub async fn limits(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, _) = BotConfig::load(config_path).await?;
    let table = cfg.limit_table();
    let mut commands: Vec<&str> = vec!["imagine", "edit", "blend"];
    for name in table.overrides.keys() {
        if !commands.contains(&name.as_str()) {
            commands.push(name.as_str());
        }
    }
    println!(
        "default: {} per {}s",
        table.default.limit, table.default.window_seconds
    );
    for command in commands {
        let limit = table.get(command);
        println!(
            "/{command}: {} per {}s",
            limit.limit, limit.window_seconds
        );
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = BotConfig::load(config_path).await?;
    let started_at = Instant::now();
    tracing::info!(
        model = %cfg.api.model,
        max_retries = cfg.api.max_retries,
        api_timeout_seconds = cfg.api.timeout_seconds,
        discord_enabled = cfg.discord.enabled,
        cache_dir = %cfg.storage.cache_dir.display(),
        job_timeout_seconds = cfg.queue.job_timeout_seconds,
        server_enabled = cfg.server.enabled,
        bind_addr = %cfg.server.bind_addr,
        config_path = %cfg_path.display(),
        "bananabot starting"
    );

    // Bind before spawning anything so a taken port fails fast.
    let listener = if cfg.server.enabled {
        let addr: SocketAddr = cfg
            .server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr {}: {e}", cfg.server.bind_addr))?;
        Some(preflight_bind_listener(addr).await?)
    } else {
        None
    };

    let transport: Arc<dyn GenerationTransport> = Arc::new(
        OpenRouterClient::new(cfg.client_options())
            .map_err(|e| anyhow::anyhow!("generation client: {e}"))?,
    );
    let dispatcher = ResilientDispatcher::new(transport.clone(), cfg.retry_policy());
    let resolver = SourceResolver::new(cfg.image_limits(), SOURCE_DOWNLOAD_TIMEOUT);
    let followups = Arc::new(FollowUpRegistry::default());
    let processor = ImageJobProcessor::new(
        cfg.api.model.clone(),
        dispatcher,
        resolver,
        ArtifactMaterializer::default(),
        followups.clone(),
    );

    let shutdown = CancellationToken::new();
    let (jobs, worker) = job_queue(
        Arc::new(processor),
        WorkerOptions {
            temp_root: cfg.jobs_dir(),
            job_timeout: cfg.job_timeout(),
            progress_step_delay: cfg.progress_step_delay(),
        },
    );
    let worker_handle = worker.start(shutdown.child_token());

    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.discord.enabled {
        let discord = DiscordAdapter::new(&cfg.discord.bot_token)?
            .with_require_mention_in_group_chats(cfg.discord.require_mention);
        channels.insert("discord".to_string(), Arc::new(discord));
    }
    if channels.is_empty() {
        tracing::warn!("no channels enabled; only the admin HTTP surface will run");
    }

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(INBOUND_BUFFER);
    for (id, channel) in &channels {
        channel.start(inbound_tx.clone()).await?;
        tracing::info!(channel = %id, "channel started");
    }
    drop(inbound_tx);

    let preferences = Arc::new(PreferenceStore::load(&cfg.storage.cache_dir).await?);
    let admission = Arc::new(AdmissionController::new(cfg.limit_table()));
    let mut channel_ids: Vec<String> = channels.keys().cloned().collect();
    channel_ids.sort();
    let gateway = Arc::new(Gateway::new(
        admission.clone(),
        jobs.clone(),
        followups.clone(),
        preferences,
        cfg.api.model.clone(),
        channels,
        inbound_rx,
    ));
    let gateway_handle = gateway.start(shutdown.child_token());

    let maintenance_handle = Maintenance::new(
        admission.clone(),
        followups.clone(),
        cfg.storage.cache_dir.clone(),
        cfg.retention(),
    )
    .start(MAINTENANCE_INTERVAL, shutdown.child_token());

    match listener {
        Some(listener) => {
            let state = Arc::new(AppState {
                started_at,
                jobs,
                admission,
                followups,
                channels: channel_ids,
                api: transport,
                cache_dir: cfg.storage.cache_dir.clone(),
            });
            let addr = listener.local_addr()?;
            tracing::info!(%addr, "bananabot serving");
            axum::serve(listener, app(state))
                .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
                .await?;
            tracing::info!("http server shutdown completed");
        }
        None => {
            tracing::info!("bananabot running without http server");
            shutdown_signal(shutdown.clone()).await;
        }
    }

    shutdown.cancel();
    for (name, handle) in [
        ("gateway", gateway_handle),
        ("job worker", worker_handle),
        ("maintenance", maintenance_handle),
    ] {
        match handle.await {
            Ok(()) => tracing::info!(task = name, "shutdown completed"),
            Err(e) => tracing::error!(task = name, error = %e, "task join failed during shutdown"),
        }
    }

    Ok(())
}

/// The admin router with the standard middleware stack.
pub fn app(state: Arc<AppState>) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(HTTP_MAX_IN_FLIGHT))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            HTTP_TIMEOUT,
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
