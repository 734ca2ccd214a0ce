use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "discord".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a new message and return its platform id so it can be edited later.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId>;

    /// Replace the content (and action buttons) of a message sent earlier.
    async fn edit(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
        message: OutboundMessage,
    ) -> Result<()>;
}
