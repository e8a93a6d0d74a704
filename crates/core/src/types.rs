use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a shared message channel.
    ChannelId
);
string_id!(
    /// Identifier of a configured agent (persona). Humans posting to the
    /// channel carry author ids in the same namespace.
    AgentId
);
string_id!(
    /// Transport-assigned message identifier.
    MessageId
);

/// One message as seen through the channel transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: AgentId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered, immutable window of channel history (oldest first).
///
/// Always produced by a fresh fetch; never carried from one decision step
/// to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    messages: Arc<[ChannelMessage]>,
}

impl MessageSnapshot {
    pub fn new(mut messages: Vec<ChannelMessage>) -> Self {
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Self { messages: messages.into() }
    }

    pub fn messages(&self) -> &[ChannelMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.message_id == id)
    }

    /// Append `message` unless it is already present. Keeps at most `limit`
    /// newest entries.
    pub fn with_message(&self, message: ChannelMessage, limit: usize) -> Self {
        let mut all = self.messages.to_vec();
        if !all.iter().any(|m| m.message_id == message.message_id) {
            all.push(message);
        }
        let mut snapshot = Self::new(all).messages.to_vec();
        if snapshot.len() > limit {
            snapshot.drain(..snapshot.len() - limit);
        }
        Self { messages: snapshot.into() }
    }

    /// Most recent message written by `author`.
    pub fn last_by(&self, author: &AgentId) -> Option<&ChannelMessage> {
        self.messages.iter().rev().find(|m| &m.author_id == author)
    }

    /// Render as `author: content` lines for prompts.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.author_id, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Lifecycle state of one observation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Scheduled,
    Observing,
    Deciding,
    Participating,
    Skipped,
    Aborted,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Observing => "observing",
            Self::Deciding => "deciding",
            Self::Participating => "participating",
            Self::Skipped => "skipped",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a task ended without posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    TopicUnchanged,
    Declined,
    UnclearDecision,
    Cooldown,
    Cancelled,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TopicUnchanged => "topic_unchanged",
            Self::Declined => "declined",
            Self::UnclearDecision => "unclear_decision",
            Self::Cooldown => "cooldown",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
