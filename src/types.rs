use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message observed in a channel. Ids are monotonic within a channel;
/// an edit updates `content` in place and never mints a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub channel_id: String,
    pub author_id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub has_attachments: bool,
}

/// A scheduled future check-in tied to a user-mentioned event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: String,
    pub user_id: String,
    pub channel_id: String,
    /// What the user mentioned ("job interview", "vet appointment").
    pub event: String,
    /// Free-text context captured when the follow-up was created.
    pub context: String,
    pub created_at: DateTime<Utc>,
    /// Set once at creation. Cleanup decides eligibility by this field,
    /// never by `created_at`: a future-dated item must survive cleanup
    /// no matter how old it is.
    pub due_at: DateTime<Utc>,
    pub priority: Priority,
    pub state: FollowUpState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpState {
    Pending,
    Executing,
    Completed,
    Expired,
}

/// Daily proactive-attempt budget for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelQuota {
    pub channel_id: String,
    /// Wall-clock day bucket, `YYYY-MM-DD`. Reset is a pure function of
    /// the current time: a read under a different bucket starts from zero.
    pub day: String,
    pub attempts_today: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Per-channel engagement history: hourly attempt/success buckets plus a
/// bounded ring of the most recent outcomes for trend computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementStat {
    /// 24 (attempts, successes) pairs indexed by hour-of-day.
    #[serde(default = "empty_hours")]
    pub hours: Vec<(u32, u32)>,
    /// Most recent outcomes, true = success. Bounded by config.
    #[serde(default)]
    pub recent: Vec<bool>,
    #[serde(default)]
    pub total_attempts: u32,
    #[serde(default)]
    pub total_successes: u32,
}

fn empty_hours() -> Vec<(u32, u32)> {
    vec![(0, 0); 24]
}

impl EngagementStat {
    pub fn new() -> Self {
        Self {
            hours: empty_hours(),
            recent: Vec::new(),
            total_attempts: 0,
            total_successes: 0,
        }
    }
}

// A derived Default would start `hours` empty and break hour indexing.
impl Default for EngagementStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel cadence classification derived from recent message timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumClass {
    Cold,
    Warm,
    Hot,
}

impl std::fmt::Display for MomentumClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MomentumClass::Cold => write!(f, "cold"),
            MomentumClass::Warm => write!(f, "warm"),
            MomentumClass::Hot => write!(f, "hot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// What caused a decision cycle to run. Logged with every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Periodic review of a channel with unreviewed messages.
    Periodic,
    /// Explicitly addressed; bypasses the momentum gate.
    Urgent,
    /// A follow-up reached its due time.
    FollowUpDue,
    /// Idle-channel proactive engagement.
    Proactive,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Periodic => write!(f, "periodic"),
            TriggerKind::Urgent => write!(f, "urgent"),
            TriggerKind::FollowUpDue => write!(f, "follow_up_due"),
            TriggerKind::Proactive => write!(f, "proactive"),
        }
    }
}

/// Terminal outcome of one decision cycle. Every variant is distinguishable
/// in logs, in particular a failed momentum draw (`Gated`, generator never
/// invoked) versus an invoked-but-empty reply (`Declined`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Momentum draw failed; the generator was never invoked.
    Gated,
    /// The generator was invoked and produced nothing worth sending.
    Declined,
    /// A message was sent.
    Responded,
    /// Channel was already claimed by another cycle; the trigger was
    /// deferred (or, for proactive scans, skipped).
    Busy,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::Gated => write!(f, "gated"),
            CycleOutcome::Declined => write!(f, "declined"),
            CycleOutcome::Responded => write!(f, "responded"),
            CycleOutcome::Busy => write!(f, "busy"),
        }
    }
}

/// One entry of assembled generation context.
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub kind: ContextKind,
    pub content: String,
    /// Estimated token cost (chars / 4 heuristic at assembly time).
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Conversation message (never trimmed by the budget manager).
    Message,
    /// Structured tool output, first candidate for trimming.
    ToolResult,
    /// Durable memory operation, exempt category.
    Memory,
}

/// Web citation attached to a final generation. Citations never count
/// toward the token budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// Closed set of generator results, decoded once at the provider boundary.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Final {
        text: String,
        citations: Vec<Citation>,
    },
    ToolRequest {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

/// A tool the generator may request, advertised with every call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One request to the generative backend.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub channel_id: String,
    pub items: Vec<ContextItem>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.tokens).sum()
    }
}

/// Rough token estimate used when assembling context.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
