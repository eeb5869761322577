use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::followup::FollowUpLifecycle;
use crate::traits::{MessageStore, Tool};
use crate::types::{Priority, ToolSpec};

/// Lets the generator schedule a future check-in when a user mentions an
/// upcoming event.
pub struct ScheduleFollowUpTool {
    lifecycle: Arc<FollowUpLifecycle>,
}

impl ScheduleFollowUpTool {
    pub fn new(lifecycle: Arc<FollowUpLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl Tool for ScheduleFollowUpTool {
    fn name(&self) -> &str {
        "schedule_follow_up"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Schedule a future check-in about an event the user mentioned."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string"},
                    "channel_id": {"type": "string"},
                    "event": {"type": "string", "description": "What to follow up about"},
                    "context": {"type": "string"},
                    "due_at": {"type": "string", "format": "date-time"},
                    "priority": {"type": "string", "enum": ["low", "medium", "high"]}
                },
                "required": ["user_id", "channel_id", "event", "due_at"]
            }),
        }
    }

    async fn execute(&self, arguments: &serde_json::Value) -> anyhow::Result<String> {
        let user_id = required_str(arguments, "user_id")?;
        let channel_id = required_str(arguments, "channel_id")?;
        let event = required_str(arguments, "event")?;
        let context = arguments["context"].as_str().unwrap_or("");
        let due_at: DateTime<Utc> = required_str(arguments, "due_at")?
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid due_at: {}", e))?;
        let priority = match arguments["priority"].as_str() {
            Some("high") => Priority::High,
            Some("low") => Priority::Low,
            _ => Priority::Medium,
        };

        if due_at <= Utc::now() {
            anyhow::bail!("due_at must be in the future");
        }

        let item = self
            .lifecycle
            .create(user_id, channel_id, event, context, due_at, priority)
            .await
            .map_err(|e| anyhow::anyhow!("failed to store follow-up: {}", e))?;
        Ok(format!(
            "follow-up {} scheduled for {} ({})",
            item.id, item.due_at, item.event
        ))
    }
}

/// Lets the generator search the channel's message window for earlier
/// context before answering.
pub struct SearchHistoryTool {
    messages: Arc<dyn MessageStore>,
}

impl SearchHistoryTool {
    pub fn new(messages: Arc<dyn MessageStore>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl Tool for SearchHistoryTool {
    fn name(&self) -> &str {
        "search_history"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: "Search recent messages in a channel for a phrase.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "channel_id": {"type": "string"},
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 5}
                },
                "required": ["channel_id", "query"]
            }),
        }
    }

    async fn execute(&self, arguments: &serde_json::Value) -> anyhow::Result<String> {
        let channel_id = required_str(arguments, "channel_id")?;
        let query = required_str(arguments, "query")?;
        let limit = arguments["limit"].as_u64().unwrap_or(5) as usize;

        let hits = self.messages.search(channel_id, query, limit).await;
        if hits.is_empty() {
            return Ok("no matches".to_string());
        }
        Ok(hits
            .iter()
            .map(|m| format!("[{}] {}: {}", m.timestamp.format("%Y-%m-%d %H:%M"), m.author_id, m.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

fn required_str<'a>(arguments: &'a serde_json::Value, key: &str) -> anyhow::Result<&'a str> {
    arguments[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{}'", key))
}
