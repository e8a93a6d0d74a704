use std::sync::Arc;

use super::{ChannelTransport, TransportError};
use crate::oracle::{DecisionOracle, OracleError};
use crate::role::RoleConfig;
use crate::types::{AgentId, ChannelId, MessageId, MessageSnapshot};

const REPLY_MAX_TOKENS: u32 = 1024;

/// Composes and posts an agent's reply. One attempt per task; retries, if
/// any, belong to the transport.
#[derive(Clone)]
pub struct ReplyDispatcher {
    transport: Arc<dyn ChannelTransport>,
    oracle: DecisionOracle,
}

impl ReplyDispatcher {
    pub fn new(transport: Arc<dyn ChannelTransport>, oracle: DecisionOracle) -> Self {
        Self { transport, oracle }
    }

    /// Reply text for `role` given the freshest `snapshot`.
    pub async fn compose(&self, role: &RoleConfig, snapshot: &MessageSnapshot) -> Result<String, OracleError> {
        let prompt = format!(
            "Conversation so far (oldest first):\n{history}\n\n\
             Write your next message in this conversation as {name}. \
             Build on what others already said instead of repeating it. \
             Reply with the message text only.",
            history = snapshot.transcript(),
            name = role.name,
        );
        let text = self.oracle.ask(role, prompt, REPLY_MAX_TOKENS).await?;
        Ok(text.trim().to_owned())
    }

    pub async fn dispatch(
        &self,
        channel: &ChannelId,
        author: &AgentId,
        text: &str,
    ) -> Result<MessageId, TransportError> {
        if text.is_empty() {
            return Err(TransportError::Rejected("empty reply".into()));
        }
        let id = self.transport.post_message(channel, author, text).await?;
        tracing::debug!(channel = %channel, agent = %author, message = %id, "reply posted");
        Ok(id)
    }
}
