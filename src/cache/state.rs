use crate::message::InboundMessage;
use std::collections::{HashSet, VecDeque};

/// Fixed-capacity ring buffer of raw messages for one channel, plus an O(1)
/// membership index. Owns the only copies of [`InboundMessage`]; eviction
/// destroys them and reports the evicted id so callers can retire auxiliary
/// state (memos, snapshots) in lockstep.
#[derive(Debug)]
pub struct ChannelCacheState {
    pub server_id: String,
    pub channel_id: String,
    capacity: usize,
    buffer: VecDeque<InboundMessage>,
    ids: HashSet<String>,
}

impl ChannelCacheState {
    pub fn new(server_id: impl Into<String>, channel_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
            capacity,
            buffer: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Append a message; at capacity the oldest entry is evicted and its id
    /// returned. A redelivered id refreshes the stored copy in place — the
    /// buffer never holds two entries for one id, so membership and memos
    /// stay in lockstep through later evictions.
    pub fn append(&mut self, message: InboundMessage) -> Option<String> {
        if self.ids.contains(&message.id) {
            if let Some(slot) = self.buffer.iter_mut().find(|m| m.id == message.id) {
                *slot = message;
            }
            return None;
        }

        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front().map(|old| {
                self.ids.remove(&old.id);
                old.id
            })
        } else {
            None
        };

        self.ids.insert(message.id.clone());
        self.buffer.push_back(message);
        evicted
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&InboundMessage> {
        if !self.ids.contains(message_id) {
            return None;
        }
        self.buffer.iter().find(|m| m.id == message_id)
    }

    /// Oldest→newest iteration; `limit` keeps the newest `limit` entries.
    pub fn iter(&self, limit: Option<usize>) -> impl Iterator<Item = &InboundMessage> {
        let skip = match limit {
            Some(n) => self.buffer.len().saturating_sub(n),
            None => 0,
        };
        self.buffer.iter().skip(skip)
    }

    /// Message ids oldest→newest.
    pub fn ids_in_order(&self) -> Vec<String> {
        self.buffer.iter().map(|m| m.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.ids.clear();
    }

    /// Install a hydration result atomically: the previous contents vanish
    /// in one step, so partially-hydrated state is never observable. Keeps
    /// the newest `capacity` messages of an oldest→newest slice.
    pub fn replace(&mut self, messages: Vec<InboundMessage>) {
        self.clear();
        let skip = messages.len().saturating_sub(self.capacity);
        for message in messages.into_iter().skip(skip) {
            self.ids.insert(message.id.clone());
            self.buffer.push_back(message);
        }
    }
}
