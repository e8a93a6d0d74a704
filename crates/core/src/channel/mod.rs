//! Channel transport seam plus the fetch/dispatch wrappers the protocol
//! builds on top of it.

pub mod dispatch;
pub mod memory;
pub mod snapshot;

pub use dispatch::ReplyDispatcher;
pub use memory::MemoryChannel;
pub use snapshot::SnapshotFetcher;

use crate::types::{AgentId, ChannelId, ChannelMessage, MessageId};

/// Failures reported by the channel collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("anchor message {0} not found")]
    AnchorNotFound(MessageId),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// The shared, append-only message channel as seen by an agent.
///
/// Implementations provide a total, monotonically increasing order of
/// messages within a channel.
#[async_trait::async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Up to `limit` most recent messages strictly before `before`
    /// (or the newest `limit` messages when `before` is `None`), oldest first.
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, TransportError>;

    /// Post `text` as `author`; returns the new message id.
    async fn post_message(
        &self,
        channel: &ChannelId,
        author: &AgentId,
        text: &str,
    ) -> Result<MessageId, TransportError>;

    /// Private message to a user, outside any channel.
    async fn send_direct_message(&self, user: &AgentId, text: &str) -> Result<(), TransportError>;
}
