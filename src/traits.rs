use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::providers::ProviderError;
use crate::state::StoreError;
use crate::types::{GenerationOutcome, GenerationRequest, Message, ToolSpec};

/// An inbound trigger flowing into the scheduler.
#[derive(Debug, Clone)]
pub struct Event {
    pub channel_id: String,
    pub message: Message,
    /// Explicitly addressed; takes the immediate path past the momentum gate.
    pub urgent: bool,
}

pub type EventSender = broadcast::Sender<Event>;
pub type EventReceiver = broadcast::Receiver<Event>;

/// Create a new event bus (broadcast channel).
pub fn event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// A collection read back from the state store, with the version the next
/// write must present. Version 0 means the key does not exist yet.
#[derive(Debug, Clone)]
pub struct VersionedCollection {
    pub body: serde_json::Value,
    pub version: i64,
}

/// Durable key-scoped storage for follow-ups, quotas, and engagement stats.
///
/// The store guarantees atomicity for a single write and optimistic
/// versioning across read-modify-write cycles; it does NOT make concurrent
/// writers to the same key safe beyond reporting [`StoreError::Stale`].
/// Callers serialize same-key mutation through the per-channel claim.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a collection. Absent keys return version 0 with a null body.
    /// Undecodable stored JSON fails closed with [`StoreError::Malformed`]
    /// and leaves the stored bytes untouched.
    async fn read_collection(&self, key: &str) -> Result<VersionedCollection, StoreError>;

    /// Write a collection, presenting the version returned by the read this
    /// write was derived from (0 to create). Returns the new version.
    async fn write_collection(
        &self,
        key: &str,
        body: &serde_json::Value,
        expected_version: i64,
    ) -> Result<i64, StoreError>;

    /// Record an idempotency token before attempting a send.
    async fn record_send_token(&self, token: &str) -> Result<(), StoreError>;

    /// Mark a recorded token as delivered.
    async fn mark_delivered(&self, token: &str) -> Result<(), StoreError>;

    /// Whether a token's send already went out. Consulted on retry so an
    /// already-delivered message is never re-sent.
    async fn is_delivered(&self, token: &str) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// External message history. The core keeps only a bounded in-memory window
/// per channel and never persists messages itself.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, or update content in place when the id exists.
    async fn append(&self, message: Message);

    /// Most recent messages, oldest first, skipping `exclude_ids`. The
    /// exclusion set is the concurrency guard's in-flight filter; context
    /// reads must never see messages owned by another active cycle.
    async fn recent(
        &self,
        channel_id: &str,
        limit: usize,
        exclude_ids: &HashSet<u64>,
    ) -> Vec<Message>;

    async fn first_n(&self, channel_id: &str, limit: usize) -> Vec<Message>;

    async fn context_around(
        &self,
        channel_id: &str,
        message_id: u64,
        before: usize,
        after: usize,
    ) -> Vec<Message>;

    async fn search(&self, channel_id: &str, query: &str, limit: usize) -> Vec<Message>;

    async fn last_message_at(&self, channel_id: &str) -> Option<DateTime<Utc>>;

    /// All channel ids currently known to the window.
    async fn channels(&self) -> Vec<String>;
}

/// The external generative backend. Content semantics live entirely behind
/// this boundary; the core only sees the closed [`GenerationOutcome`] set.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    async fn invoke(&self, request: &GenerationRequest)
        -> Result<GenerationOutcome, ProviderError>;
}

/// Outbound transport for one chat surface.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> String;

    /// Whether this channel owns the given channel id.
    fn handles(&self, channel_id: &str) -> bool;

    async fn send_message(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;
}

/// A locally executable tool the generator may request.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> ToolSpec;

    async fn execute(&self, arguments: &serde_json::Value) -> anyhow::Result<String>;
}
