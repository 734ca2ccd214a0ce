use crate::traits::ChannelAdapter;
use crate::types::{
    Attachment, InboundMessage, InboundMessageKind, MessageAction, MessageId, OutboundFile,
    OutboundMessage,
};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
// GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const DISCORD_DEFAULT_INTENTS: u64 = (1 << 9) | (1 << 12) | (1 << 15);
const DISCORD_RECONNECT_BASE_MS: u64 = 1_000;
const DISCORD_RECONNECT_MAX_MS: u64 = 60_000;

const INTERACTION_MESSAGE_COMPONENT: u64 = 3;
const CALLBACK_DEFERRED_UPDATE_MESSAGE: u64 = 6;
const BUTTONS_PER_ROW: usize = 5;
const MAX_ACTION_ROWS: usize = 5;
const BUTTON_STYLE_SECONDARY: u64 = 2;

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    gateway_intents: u64,
    require_mention_in_group_chats: bool,
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("discord bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            gateway_intents: DISCORD_DEFAULT_INTENTS,
            require_mention_in_group_chats: false,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{DISCORD_API_BASE}{path}")
    }

    pub fn with_gateway_intents(mut self, gateway_intents: u64) -> Self {
        self.gateway_intents = gateway_intents;
        self
    }

    pub fn with_require_mention_in_group_chats(
        mut self,
        require_mention_in_group_chats: bool,
    ) -> Self {
        self.require_mention_in_group_chats = require_mention_in_group_chats;
        self
    }

    async fn submit(
        &self,
        method: Method,
        url: String,
        message: &OutboundMessage,
    ) -> Result<serde_json::Value> {
        let payload = message_payload(message);
        let request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.bot_token));
        let request = if message.files.is_empty() {
            request.json(&payload)
        } else {
            request.multipart(multipart_form(payload, &message.files).await?)
        };

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord request failed: status={status} body={text}"
            ));
        }
        Ok(resp.json().await?)
    }

    async fn acknowledge_interaction(&self, id: &str, token: &str) -> Result<()> {
        let url = self.api_url(&format!("/interactions/{id}/{token}/callback"));
        let body = serde_json::json!({ "type": CALLBACK_DEFERRED_UPDATE_MESSAGE });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord interaction ack failed: status={status} body={text}"
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_id(&self) -> &str {
        "discord"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            adapter.run_gateway_loop(tx).await;
        });
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let url = self.api_url(&format!("/channels/{recipient_id}/messages"));
        let created = self.submit(Method::POST, url, &message).await?;
        let id = created
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| anyhow::anyhow!("discord send response missing message id"))?;
        Ok(MessageId::new(id))
    }

    async fn edit(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()> {
        let url = self.api_url(&format!("/channels/{recipient_id}/messages/{message_id}"));
        self.submit(Method::PATCH, url, &message).await?;
        Ok(())
    }
}

impl DiscordAdapter {
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundMessage>) {
        let mut consecutive_failures = 0u32;
        loop {
            let error = match self.run_gateway_once(tx.clone()).await {
                Ok(()) => return,
                Err(error) => error,
            };
            if tx.is_closed() {
                tracing::info!(%error, "discord inbound queue closed; stopping gateway");
                return;
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
            let delay = reconnect_delay(consecutive_failures);
            tracing::warn!(
                %error,
                attempt = consecutive_failures,
                ?delay,
                "discord gateway disconnected; reconnecting with backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_gateway_once(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        // HELLO.
        let heartbeat_interval_ms: u64 = if let Some(msg) = read.next().await {
            let msg = msg?;
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;
            v.get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|x| x.as_u64())
                .ok_or_else(|| anyhow::anyhow!("discord HELLO missing heartbeat_interval"))?
        } else {
            return Err(anyhow::anyhow!("discord gateway closed before HELLO"));
        };

        // IDENTIFY.
        let identify = serde_json::json!({
            "op": 2,
            "d": {
                "token": format!("Bot {}", self.bot_token),
                "intents": self.gateway_intents,
                "properties": { "os": "linux", "browser": "bananabot", "device": "bananabot" }
            }
        });
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));

        let heartbeat = {
            let write = write.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
                loop {
                    interval.tick().await;
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let result = self.pump_events(read, &seq, &tx).await;
        heartbeat.abort();
        result
    }

    async fn pump_events<S>(
        &self,
        mut read: S,
        seq: &RwLock<Option<i64>>,
        tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        let mut bot_user_id: Option<String> = None;
        while let Some(msg) = read.next().await {
            let msg = msg?;
            if msg.is_close() {
                break;
            }
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;

            if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                *seq.write().await = Some(s);
            }

            let op = v
                .get("op")
                .and_then(|o| o.as_i64())
                .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
            match op {
                11 => continue,
                7 => return Err(anyhow::anyhow!("discord requested reconnect")),
                9 => return Err(anyhow::anyhow!("discord invalidated the session")),
                _ => {}
            }

            let payload = v.get("d").cloned().unwrap_or(serde_json::Value::Null);
            match v.get("t").and_then(|t| t.as_str()) {
                Some("READY") => {
                    bot_user_id = payload
                        .get("user")
                        .and_then(|u| u.get("id"))
                        .and_then(|id| id.as_str())
                        .map(|s| s.to_string());
                    tracing::info!(bot_user_id = ?bot_user_id, "discord gateway ready");
                }
                Some("MESSAGE_CREATE") => {
                    let event: DiscordMessageCreate = serde_json::from_value(payload)?;
                    let inbound = inbound_from_message(
                        event,
                        bot_user_id.as_deref(),
                        self.require_mention_in_group_chats,
                    );
                    if let Some(inbound) = inbound {
                        tx.send(inbound)
                            .await
                            .map_err(|e| anyhow::anyhow!("discord inbound queue closed: {e}"))?;
                    }
                }
                Some("INTERACTION_CREATE") => {
                    let interaction: DiscordInteraction = serde_json::from_value(payload)?;
                    let Some(inbound) = inbound_from_interaction(&interaction) else {
                        continue;
                    };
                    if let Err(error) = self
                        .acknowledge_interaction(&interaction.id, &interaction.token)
                        .await
                    {
                        tracing::warn!(%error, "failed to acknowledge discord interaction");
                    }
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("discord inbound queue closed: {e}"))?;
                }
                Some(_) | None => {}
            }
        }

        Err(anyhow::anyhow!("discord gateway stream ended unexpectedly"))
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((DISCORD_RECONNECT_BASE_MS * multiplier).min(DISCORD_RECONNECT_MAX_MS))
}

fn message_payload(message: &OutboundMessage) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "content": message.content,
        "components": components(&message.actions),
        "allowed_mentions": { "parse": [] },
    });
    if let Some(reply_to) = &message.reply_to_message_id {
        payload["message_reference"] = serde_json::json!({
            "message_id": reply_to.as_str(),
            "fail_if_not_exists": false,
        });
    }
    if !message.files.is_empty() {
        payload["attachments"] = message
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| serde_json::json!({ "id": i, "filename": f.name }))
            .collect();
    }
    payload
}

fn components(actions: &[MessageAction]) -> serde_json::Value {
    actions
        .chunks(BUTTONS_PER_ROW)
        .take(MAX_ACTION_ROWS)
        .map(|row| {
            let buttons: Vec<serde_json::Value> = row
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "type": 2,
                        "style": BUTTON_STYLE_SECONDARY,
                        "label": a.label,
                        "custom_id": a.custom_id,
                    })
                })
                .collect();
            serde_json::json!({ "type": 1, "components": buttons })
        })
        .collect()
}

async fn multipart_form(
    payload: serde_json::Value,
    files: &[OutboundFile],
) -> Result<reqwest::multipart::Form> {
    let mut form = reqwest::multipart::Form::new().text("payload_json", payload.to_string());
    for (i, file) in files.iter().enumerate() {
        let bytes = tokio::fs::read(&file.path).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file.name.clone())
            .mime_str(&file.content_type)?;
        form = form.part(format!("files[{i}]"), part);
    }
    Ok(form)
}

fn inbound_from_message(
    event: DiscordMessageCreate,
    bot_user_id: Option<&str>,
    require_mention_in_group_chats: bool,
) -> Option<InboundMessage> {
    if event.author.bot {
        return None;
    }

    let is_group = event.guild_id.is_some();
    let mut content = event.content.clone();
    if let Some(bot_id) = bot_user_id {
        let mention1 = format!("<@{bot_id}>");
        let mention2 = format!("<@!{bot_id}>");
        let mentioned = content.contains(&mention1) || content.contains(&mention2);
        if is_group && require_mention_in_group_chats && !mentioned {
            return None;
        }
        content = content
            .replace(&mention1, "")
            .replace(&mention2, "")
            .trim()
            .to_string();
    }

    let metadata = serde_json::to_value(&event).unwrap_or_default();
    let attachments = event
        .attachments
        .into_iter()
        .map(|a| Attachment {
            name: a.filename,
            content_type: a.content_type,
            url: a.url,
            size: a.size,
        })
        .collect();
    Some(InboundMessage {
        kind: InboundMessageKind::Message,
        message_id: event.id.into(),
        channel_id: "discord".into(),
        sender_id: event.author.id.into(),
        thread_id: Some(event.channel_id.into()),
        is_group,
        content,
        attachments,
        metadata,
        received_at: Utc::now(),
    })
}

fn inbound_from_interaction(interaction: &DiscordInteraction) -> Option<InboundMessage> {
    if interaction.kind != INTERACTION_MESSAGE_COMPONENT {
        return None;
    }
    let custom_id = interaction.data.as_ref()?.custom_id.clone();
    let user = interaction
        .member
        .as_ref()
        .map(|m| &m.user)
        .or(interaction.user.as_ref())?;
    let message_id = interaction
        .message
        .as_ref()
        .map(|m| m.id.clone())
        .unwrap_or_else(|| interaction.id.clone());
    Some(InboundMessage {
        kind: InboundMessageKind::Action,
        message_id: message_id.into(),
        channel_id: "discord".into(),
        sender_id: user.id.clone().into(),
        thread_id: interaction.channel_id.clone().map(Into::into),
        is_group: interaction.guild_id.is_some(),
        content: custom_id,
        attachments: Vec::new(),
        metadata: serde_json::Value::Null,
        received_at: Utc::now(),
    })
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordAuthor,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct DiscordAuthor {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct DiscordAttachment {
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DiscordInteraction {
    id: String,
    token: String,
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    member: Option<DiscordMember>,
    #[serde(default)]
    user: Option<DiscordAuthor>,
    #[serde(default)]
    data: Option<DiscordComponentData>,
    #[serde(default)]
    message: Option<DiscordMessageRef>,
}

#[derive(Debug, Deserialize)]
struct DiscordMember {
    user: DiscordAuthor,
}

#[derive(Debug, Deserialize)]
struct DiscordComponentData {
    #[serde(default)]
    custom_id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordMessageRef {
    id: String,
}
