use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{AgentId, ChannelId, MessageId};

/// Stable key of a topic-change question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicKey(u64);

impl TopicKey {
    /// Key for "does `context` move `channel` on from where `agent` last
    /// spoke at `since`". The context is compared case- and
    /// whitespace-insensitively, so a repeated question maps to the same key.
    pub fn new(channel: &ChannelId, agent: &AgentId, since: &MessageId, context: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        agent.hash(&mut hasher);
        since.hash(&mut hasher);
        for word in context.split_whitespace() {
            word.to_lowercase().hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

#[derive(Debug, Clone, Copy)]
struct TopicCacheEntry {
    topic_changed: bool,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TopicKey, TopicCacheEntry>,
    /// Insertion order; stale `(key, seq)` pairs are skipped lazily.
    order: VecDeque<(TopicKey, u64)>,
    next_seq: u64,
}

/// Bounded, TTL'd memo of topic-change answers.
///
/// TTL is uniform, so insertion order is also expiry order and a single
/// queue drives both kinds of eviction.
#[derive(Debug)]
pub struct TopicCache {
    inner: Mutex<Inner>,
    max: usize,
    ttl: Duration,
}

impl TopicCache {
    pub fn new(max: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max: max.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: TopicKey) -> Option<bool> {
        let mut inner = self.inner.lock();
        let entry = *inner.entries.get(&key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            inner.entries.remove(&key);
            return None;
        }
        Some(entry.topic_changed)
    }

    pub fn put(&self, key: TopicKey, topic_changed: bool) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            TopicCacheEntry {
                topic_changed,
                inserted_at: Instant::now(),
                seq,
            },
        );
        inner.order.push_back((key, seq));
        if inner.entries.len() > self.max {
            self.evict(&mut inner);
        }
        self.compact(&mut inner);
    }

    /// Drop expired entries, then the oldest until within bounds.
    /// Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = self.evict(&mut inner);
        self.compact(&mut inner);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, inner: &mut Inner) -> usize {
        let mut removed = 0;
        while let Some(&(key, seq)) = inner.order.front() {
            let live = inner.entries.get(&key).is_some_and(|e| e.seq == seq);
            if !live {
                inner.order.pop_front();
                continue;
            }
            let expired = inner
                .entries
                .get(&key)
                .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl);
            if !expired && inner.entries.len() <= self.max {
                break;
            }
            inner.order.pop_front();
            inner.entries.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Keep the order queue proportional to the live entry count.
    fn compact(&self, inner: &mut Inner) {
        if inner.order.len() > inner.entries.len() * 2 + 64 {
            let entries = &inner.entries;
            inner
                .order
                .retain(|(key, seq)| entries.get(key).is_some_and(|e| e.seq == *seq));
        }
    }
}
