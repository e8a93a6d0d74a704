use std::sync::Arc;

use super::{ChannelTransport, TransportError};
use crate::types::{ChannelId, ChannelMessage, MessageId, MessageSnapshot};

/// Reads observation windows from the channel transport.
///
/// An anchored read that fails (typically because the anchor was deleted
/// while the task was waiting) is retried once without the anchor.
#[derive(Clone)]
pub struct SnapshotFetcher {
    transport: Arc<dyn ChannelTransport>,
}

impl SnapshotFetcher {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self { transport }
    }

    pub async fn fetch(
        &self,
        channel: &ChannelId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<MessageSnapshot, TransportError> {
        match self.transport.fetch_history(channel, before, limit).await {
            Ok(messages) => Ok(MessageSnapshot::new(messages)),
            Err(e) if before.is_some() => {
                tracing::warn!(
                    channel = %channel,
                    anchor = ?before.map(MessageId::as_str),
                    error = %e,
                    "anchored history fetch failed, retrying without anchor"
                );
                let messages = self.transport.fetch_history(channel, None, limit).await?;
                Ok(MessageSnapshot::new(messages))
            }
            Err(e) => Err(e),
        }
    }

    /// Window leading up to and including `trigger`.
    pub async fn fetch_initial(
        &self,
        trigger: &ChannelMessage,
        limit: usize,
    ) -> Result<MessageSnapshot, TransportError> {
        let history = self
            .fetch(&trigger.channel_id, Some(&trigger.message_id), limit)
            .await?;
        Ok(history.with_message(trigger.clone(), limit))
    }

    /// Newest `limit` messages, unconstrained.
    pub async fn refresh(&self, channel: &ChannelId, limit: usize) -> Result<MessageSnapshot, TransportError> {
        self.fetch(channel, None, limit).await
    }
}
