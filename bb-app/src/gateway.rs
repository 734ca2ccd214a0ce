//! Inbound multiplexer: every channel adapter feeds one queue, and each
//! message is parsed, admitted and enqueued here.

use crate::admission::AdmissionController;
use crate::commands::{self, Command};
use crate::followup::FollowUpRegistry;
use crate::preferences::{PreferenceChange, PreferenceStore};
use crate::queue::{JobContext, JobKind, JobParams, JobSender};
use anyhow::Result;
use bb_channels::{ChannelAdapter, InboundMessage, InboundMessageKind, OutboundMessage};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    admission: Arc<AdmissionController>,
    jobs: JobSender,
    followups: Arc<FollowUpRegistry>,
    preferences: Arc<PreferenceStore>,
    model: String,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl Gateway {
    pub fn new(
        admission: Arc<AdmissionController>,
        jobs: JobSender,
        followups: Arc<FollowUpRegistry>,
        preferences: Arc<PreferenceStore>,
        model: String,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            admission,
            jobs,
            followups,
            preferences,
            model,
            channels,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return Ok(());
            };

            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel = %inbound.channel_id, sender = %inbound.sender_id, kind = ?inbound.kind)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let channel = self
            .channels
            .get(inbound.channel_id.as_str())
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", inbound.channel_id))?
            .clone();

        match inbound.kind {
            InboundMessageKind::Message => self.handle_message(&channel, &inbound).await,
            InboundMessageKind::Action => self.handle_action(&channel, &inbound).await,
        }
    }

    async fn handle_message(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
    ) -> Result<()> {
        let prefs = self.preferences.get(inbound.sender_id.as_str());
        let Some(parsed) = commands::parse(&inbound.content, &inbound.attachments, &prefs) else {
            return Ok(());
        };
        match parsed {
            Err(e) => {
                tracing::info!(reason = %e, "command rejected by validation");
                reply(channel, inbound, format!("❌ {e}")).await
            }
            Ok(Command::Help) => reply(channel, inbound, commands::help_text()).await,
            Ok(Command::Info) => reply(channel, inbound, commands::info_text(&self.model)).await,
            Ok(Command::Prefs(change)) => self.update_preferences(channel, inbound, change).await,
            Ok(Command::Job(request)) => {
                self.admit_and_enqueue(channel, inbound, request.kind, request.params)
                    .await
            }
        }
    }

    async fn update_preferences(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
        change: PreferenceChange,
    ) -> Result<()> {
        let text = match self
            .preferences
            .apply(inbound.sender_id.as_str(), change)
            .await
        {
            Ok(prefs) => prefs.describe(),
            Err(e) => {
                tracing::error!(%e, "failed to save preferences");
                "❌ Could not save your preferences. Please try again later.".to_string()
            }
        };
        reply(channel, inbound, text).await
    }

    async fn handle_action(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
    ) -> Result<()> {
        let Some(spec) = self.followups.resolve(&inbound.content, Utc::now()) else {
            return reply(
                channel,
                inbound,
                "⌛ This button has expired. Run the command again.".to_string(),
            )
            .await;
        };
        let Some((kind, params)) = spec.to_request() else {
            return reply(
                channel,
                inbound,
                "❌ That action is not available for this result.".to_string(),
            )
            .await;
        };
        tracing::info!(action = ?spec.action, %kind, "replaying follow-up");
        self.admit_and_enqueue(channel, inbound, kind, params).await
    }

    async fn admit_and_enqueue(
        &self,
        channel: &Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
        kind: JobKind,
        params: JobParams,
    ) -> Result<()> {
        let now = Utc::now();
        let command = kind.command_name();
        let decision = self
            .admission
            .check_admission(inbound.sender_id.as_str(), command, now);
        if !decision.accepted {
            let wait = (decision.reset_time - now).num_seconds().max(0);
            return reply(
                channel,
                inbound,
                format!(
                    "⏳ Rate limit reached for /{command}. {} request(s) remaining; try again in {wait}s.",
                    decision.remaining
                ),
            )
            .await;
        }

        let context = JobContext {
            channel: channel.clone(),
            recipient: inbound.reply_target().to_string(),
            user_id: inbound.sender_id.to_string(),
            reply_to: Some(inbound.message_id.clone()),
        };
        let text = match self.jobs.enqueue_job(kind, context, params) {
            Ok(position) => format!("📥 Queued (position {position})"),
            Err(e) => {
                tracing::warn!(%e, "enqueue failed");
                e.user_message()
            }
        };
        reply(channel, inbound, text).await
    }
}

async fn reply(
    channel: &Arc<dyn ChannelAdapter>,
    inbound: &InboundMessage,
    content: String,
) -> Result<()> {
    channel
        .send(
            inbound.reply_target(),
            OutboundMessage::text(content).replying_to(Some(inbound.message_id.clone())),
        )
        .await?;
    Ok(())
}
