//! In-memory messaging surface for unit tests.

use crate::error::JobError;
use crate::progress::ProgressReporter;
use crate::queue::{JobContext, JobProcessor, QueueItem};
use anyhow::Result;
use async_trait::async_trait;
use bb_channels::{ChannelAdapter, InboundMessage, MessageId, OutboundMessage};
use bb_media::TempResources;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub recipient: String,
    pub id: MessageId,
    /// Content after every edit applied so far.
    pub current: OutboundMessage,
}

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    edits: Mutex<Vec<(MessageId, OutboundMessage)>>,
    messages: Mutex<Vec<Recorded>>,
    reject_sends: AtomicBool,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("lock").len()
    }

    pub fn edit_count(&self) -> usize {
        self.edits.lock().expect("lock").len()
    }

    /// While set, every send fails and nothing is recorded.
    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    pub fn edited_ids(&self) -> Vec<MessageId> {
        self.edits
            .lock()
            .expect("lock")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn last_edit(&self) -> Option<OutboundMessage> {
        self.edits
            .lock()
            .expect("lock")
            .last()
            .map(|(_, msg)| msg.clone())
    }

    /// Latest content of every message, in send order.
    pub fn final_contents(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("lock")
            .iter()
            .map(|m| m.current.content.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.messages.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("send rejected"));
        }
        let mut messages = self.messages.lock().expect("lock");
        let id = MessageId::new(format!("msg-{}", messages.len() + 1));
        messages.push(Recorded {
            recipient: recipient_id.to_string(),
            id: id.clone(),
            current: message.clone(),
        });
        self.sent
            .lock()
            .expect("lock")
            .push((recipient_id.to_string(), message));
        Ok(id)
    }

    async fn edit(
        &self,
        _recipient_id: &str,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut messages = self.messages.lock().expect("lock");
        let Some(existing) = messages.iter_mut().find(|m| &m.id == message_id) else {
            return Err(anyhow::anyhow!("unknown message {message_id}"));
        };
        existing.current = message.clone();
        self.edits
            .lock()
            .expect("lock")
            .push((message_id.clone(), message));
        Ok(())
    }
}

pub fn test_context(channel: &Arc<RecordingChannel>, user_id: &str) -> JobContext {
    JobContext {
        channel: channel.clone(),
        recipient: format!("dm-{user_id}"),
        user_id: user_id.to_string(),
        reply_to: Some(MessageId::new("cmd-1")),
    }
}

/// Accepts every job without doing anything.
pub struct NoopProcessor;

#[async_trait]
impl JobProcessor for NoopProcessor {
    async fn process(
        &self,
        _item: &QueueItem,
        _temp: &mut TempResources,
        progress: &mut ProgressReporter,
    ) -> std::result::Result<(), JobError> {
        progress.complete(0, Vec::new()).await
    }
}
