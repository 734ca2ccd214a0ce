//! Messaging surfaces for bananabot.
//!
//! Adapters are pure I/O: they turn platform events into [`InboundMessage`]s
//! and deliver [`OutboundMessage`]s, including in-place edits of a message the
//! bot already sent.

mod discord;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    Attachment, ChannelId, InboundMessage, InboundMessageKind, MessageAction, MessageId,
    OutboundFile, OutboundMessage, SenderId, ThreadId,
};
