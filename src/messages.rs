use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::traits::MessageStore;
use crate::types::Message;

/// Bounded in-memory message window per channel. The core never persists
/// messages; this window is rebuilt from the platform on demand.
pub struct InMemoryMessageStore {
    channels: RwLock<HashMap<String, VecDeque<Message>>>,
    cap: usize,
}

impl InMemoryMessageStore {
    pub fn new(cap: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            cap,
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: Message) {
        let mut channels = self.channels.write().await;
        let window = channels.entry(message.channel_id.clone()).or_default();

        // An edit reuses the id: update content in place, never a new entry.
        if let Some(existing) = window.iter_mut().find(|m| m.id == message.id) {
            existing.content = message.content;
            existing.has_attachments = message.has_attachments;
            return;
        }

        window.push_back(message);
        while window.len() > self.cap {
            window.pop_front();
        }
    }

    async fn recent(
        &self,
        channel_id: &str,
        limit: usize,
        exclude_ids: &HashSet<u64>,
    ) -> Vec<Message> {
        let channels = self.channels.read().await;
        let Some(window) = channels.get(channel_id) else {
            return Vec::new();
        };
        let mut picked: Vec<Message> = window
            .iter()
            .rev()
            .filter(|m| !exclude_ids.contains(&m.id))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    async fn first_n(&self, channel_id: &str, limit: usize) -> Vec<Message> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .map(|w| w.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    async fn context_around(
        &self,
        channel_id: &str,
        message_id: u64,
        before: usize,
        after: usize,
    ) -> Vec<Message> {
        let channels = self.channels.read().await;
        let Some(window) = channels.get(channel_id) else {
            return Vec::new();
        };
        let Some(pos) = window.iter().position(|m| m.id == message_id) else {
            return Vec::new();
        };
        let start = pos.saturating_sub(before);
        let end = (pos + after + 1).min(window.len());
        window.iter().skip(start).take(end - start).cloned().collect()
    }

    async fn search(&self, channel_id: &str, query: &str, limit: usize) -> Vec<Message> {
        let needle = query.to_lowercase();
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .map(|w| {
                w.iter()
                    .filter(|m| m.content.to_lowercase().contains(&needle))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn last_message_at(&self, channel_id: &str) -> Option<DateTime<Utc>> {
        let channels = self.channels.read().await;
        channels
            .get(channel_id)
            .and_then(|w| w.back())
            .map(|m| m.timestamp)
    }

    async fn channels(&self) -> Vec<String> {
        let channels = self.channels.read().await;
        channels.keys().cloned().collect()
    }
}
