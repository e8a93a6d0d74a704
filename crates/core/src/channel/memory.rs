use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;

use super::{ChannelTransport, TransportError};
use crate::types::{AgentId, ChannelId, ChannelMessage, MessageId};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct State {
    channels: HashMap<ChannelId, Vec<ChannelMessage>>,
    direct: Vec<(AgentId, String)>,
    next_id: u64,
    last_ts: Option<DateTime<Utc>>,
}

/// In-process channel transport.
///
/// Message ids are assigned from a single counter and timestamps never go
/// backwards, so every channel has a total order. New messages are
/// broadcast to subscribers. Failure knobs exist for exercising the
/// degraded paths.
#[derive(Debug)]
pub struct MemoryChannel {
    state: Mutex<State>,
    tx: broadcast::Sender<ChannelMessage>,
    failing_fetches: AtomicUsize,
    fail_posts: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            tx,
            failing_fetches: AtomicUsize::new(0),
            fail_posts: AtomicBool::new(false),
        }
    }

    /// Append a message and notify subscribers.
    pub fn post(&self, channel: &ChannelId, author: &AgentId, text: &str) -> ChannelMessage {
        let msg = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let now = Utc::now();
            let ts = match state.last_ts {
                Some(last) if now <= last => last + chrono::Duration::microseconds(1),
                _ => now,
            };
            state.last_ts = Some(ts);
            let msg = ChannelMessage {
                message_id: MessageId::new(format!("m{:08}", state.next_id)),
                channel_id: channel.clone(),
                author_id: author.clone(),
                content: text.to_owned(),
                timestamp: ts,
            };
            state.channels.entry(channel.clone()).or_default().push(msg.clone());
            msg
        };
        // No subscribers is fine.
        let _ = self.tx.send(msg.clone());
        msg
    }

    /// Remove a message; returns false if it did not exist.
    pub fn delete_message(&self, channel: &ChannelId, id: &MessageId) -> bool {
        let mut state = self.state.lock();
        let Some(msgs) = state.channels.get_mut(channel) else {
            return false;
        };
        let before = msgs.len();
        msgs.retain(|m| &m.message_id != id);
        msgs.len() != before
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.tx.subscribe()
    }

    /// Full history of `channel`, oldest first.
    pub fn messages(&self, channel: &ChannelId) -> Vec<ChannelMessage> {
        self.state.lock().channels.get(channel).cloned().unwrap_or_default()
    }

    pub fn direct_messages(&self) -> Vec<(AgentId, String)> {
        self.state.lock().direct.clone()
    }

    /// Make the next `n` history fetches fail with `Unavailable`.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    fn take_fetch_failure(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChannelTransport for MemoryChannel {
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, TransportError> {
        if self.take_fetch_failure() {
            return Err(TransportError::Unavailable("injected fetch failure".into()));
        }
        let state = self.state.lock();
        let msgs = state
            .channels
            .get(channel)
            .ok_or_else(|| TransportError::UnknownChannel(channel.clone()))?;
        let end = match before {
            Some(anchor) => msgs
                .iter()
                .position(|m| &m.message_id == anchor)
                .ok_or_else(|| TransportError::AnchorNotFound(anchor.clone()))?,
            None => msgs.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(msgs[start..end].to_vec())
    }

    async fn post_message(
        &self,
        channel: &ChannelId,
        author: &AgentId,
        text: &str,
    ) -> Result<MessageId, TransportError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("injected post failure".into()));
        }
        Ok(self.post(channel, author, text).message_id)
    }

    async fn send_direct_message(&self, user: &AgentId, text: &str) -> Result<(), TransportError> {
        self.state.lock().direct.push((user.clone(), text.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(msgs: &[ChannelMessage]) -> Vec<&str> {
        msgs.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn fetch_before_anchor_and_latest() {
        let ch = MemoryChannel::new();
        let general: ChannelId = "general".into();
        let user: AgentId = "user".into();
        for text in ["a", "b", "c", "d"] {
            ch.post(&general, &user, text);
        }
        let all = ch.messages(&general);
        let before_c = ch.fetch_history(&general, Some(&all[2].message_id), 10).await.unwrap();
        assert_eq!(ids(&before_c), ["a", "b"]);
        let latest = ch.fetch_history(&general, None, 3).await.unwrap();
        assert_eq!(ids(&latest), ["b", "c", "d"]);
    }

    #[tokio::test]
    async fn deleted_anchor_is_reported() {
        let ch = MemoryChannel::new();
        let general: ChannelId = "general".into();
        let m = ch.post(&general, &"user".into(), "hello");
        assert!(ch.delete_message(&general, &m.message_id));
        let err = ch.fetch_history(&general, Some(&m.message_id), 5).await.unwrap_err();
        assert!(matches!(err, TransportError::AnchorNotFound(_)));
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let ch = MemoryChannel::new();
        let general: ChannelId = "general".into();
        for i in 0..50 {
            ch.post(&general, &"user".into(), &i.to_string());
        }
        let msgs = ch.messages(&general);
        assert!(msgs.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn subscribers_see_posts_and_failures_are_injectable() {
        let ch = MemoryChannel::new();
        let mut rx = ch.subscribe();
        let general: ChannelId = "general".into();
        ch.post_message(&general, &"expert".into(), "hi").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "hi");

        ch.fail_next_fetches(1);
        assert!(ch.fetch_history(&general, None, 5).await.is_err());
        assert!(ch.fetch_history(&general, None, 5).await.is_ok());

        ch.set_fail_posts(true);
        assert!(ch.post_message(&general, &"expert".into(), "x").await.is_err());
    }
}
