use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub momentum: MomentumConfig,
    #[serde(default)]
    pub proactive: ProactiveConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub followups: FollowUpConfig,
    #[serde(default)]
    pub engagement: EngagementConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Cap on the in-memory message window kept per channel.
    #[serde(default = "default_message_window")]
    pub message_window: usize,
}

fn default_db_path() -> String {
    "cadenced.db".to_string()
}

fn default_message_window() -> usize {
    200
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            message_window: default_message_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Global cap on simultaneous decision cycles (external calls).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Messages pulled into context per cycle.
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
    /// Cap on generator tool-request round trips per cycle.
    #[serde(default = "default_tool_loop_cap")]
    pub tool_loop_cap: usize,
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_event_capacity() -> usize {
    256
}

fn default_context_messages() -> usize {
    50
}

fn default_tool_loop_cap() -> usize {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            max_concurrent: default_max_concurrent(),
            event_capacity: default_event_capacity(),
            context_messages: default_context_messages(),
            tool_loop_cap: default_tool_loop_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MomentumConfig {
    /// How many recent message timestamps feed the classification.
    #[serde(default = "default_momentum_window")]
    pub window: usize,
    /// Mean gap below this many minutes classifies hot.
    #[serde(default = "default_hot_max_gap_mins")]
    pub hot_max_gap_mins: i64,
    /// Mean gap below this many minutes classifies warm.
    #[serde(default = "default_warm_max_gap_mins")]
    pub warm_max_gap_mins: i64,
    #[serde(default = "default_cold_probability")]
    pub cold_probability: f64,
    #[serde(default = "default_warm_probability")]
    pub warm_probability: f64,
    #[serde(default = "default_hot_probability")]
    pub hot_probability: f64,
}

fn default_momentum_window() -> usize {
    20
}

fn default_hot_max_gap_mins() -> i64 {
    15
}

fn default_warm_max_gap_mins() -> i64 {
    60
}

fn default_cold_probability() -> f64 {
    0.10
}

fn default_warm_probability() -> f64 {
    0.25
}

fn default_hot_probability() -> f64 {
    0.40
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            window: default_momentum_window(),
            hot_max_gap_mins: default_hot_max_gap_mins(),
            warm_max_gap_mins: default_warm_max_gap_mins(),
            cold_probability: default_cold_probability(),
            warm_probability: default_warm_probability(),
            hot_probability: default_hot_probability(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProactiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_idle_mins")]
    pub min_idle_mins: i64,
    #[serde(default = "default_max_idle_mins")]
    pub max_idle_mins: i64,
    /// Minimum engagement success rate before spending quota on a channel.
    #[serde(default = "default_success_rate_threshold")]
    pub success_rate_threshold: f64,
    /// Channels with fewer total attempts than this skip the rate gate.
    #[serde(default = "default_rate_gate_min_attempts")]
    pub rate_gate_min_attempts: u32,
    #[serde(default = "default_per_channel_daily_limit")]
    pub per_channel_daily_limit: u32,
    #[serde(default = "default_global_daily_limit")]
    pub global_daily_limit: u32,
    /// Minimum gap between proactive attempts in the same channel.
    #[serde(default = "default_min_gap_mins")]
    pub min_gap_mins: i64,
}

fn default_true() -> bool {
    true
}

fn default_min_idle_mins() -> i64 {
    120
}

fn default_max_idle_mins() -> i64 {
    2880
}

fn default_success_rate_threshold() -> f64 {
    0.3
}

fn default_rate_gate_min_attempts() -> u32 {
    5
}

fn default_per_channel_daily_limit() -> u32 {
    3
}

fn default_global_daily_limit() -> u32 {
    10
}

fn default_min_gap_mins() -> i64 {
    240
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            min_idle_mins: default_min_idle_mins(),
            max_idle_mins: default_max_idle_mins(),
            success_rate_threshold: default_success_rate_threshold(),
            rate_gate_min_attempts: default_rate_gate_min_attempts(),
            per_channel_daily_limit: default_per_channel_daily_limit(),
            global_daily_limit: default_global_daily_limit(),
            min_gap_mins: default_min_gap_mins(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the open circuit rejects calls before probing.
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_close_successes")]
    pub close_successes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_secs() -> u64 {
    60
}

fn default_close_successes() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_secs: default_open_secs(),
            close_successes: default_close_successes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    /// Context token count that triggers pre-call trimming.
    #[serde(default = "default_trigger_tokens")]
    pub trigger_tokens: usize,
    /// Most recent exempt items always preserved when trimming.
    #[serde(default = "default_min_exempt_keep")]
    pub min_exempt_keep: usize,
}

fn default_trigger_tokens() -> usize {
    8000
}

fn default_min_exempt_keep() -> usize {
    5
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: default_trigger_tokens(),
            min_exempt_keep: default_min_exempt_keep(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FollowUpConfig {
    /// Overdue items past this age are expired as stuck.
    #[serde(default = "default_stuck_after_days")]
    pub stuck_after_days: i64,
    /// Completed items older than this are archived (deleted).
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: i64,
}

fn default_stuck_after_days() -> i64 {
    7
}

fn default_archive_after_days() -> i64 {
    30
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            stuck_after_days: default_stuck_after_days(),
            archive_after_days: default_archive_after_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngagementConfig {
    /// Ring size of most recent outcomes used for trend computation.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    /// Divergence from the all-time rate that flips the trend label.
    #[serde(default = "default_trend_divergence")]
    pub trend_divergence: f64,
    /// Minimum attempts before an hour bucket counts as "best".
    #[serde(default = "default_min_hour_samples")]
    pub min_hour_samples: u32,
}

fn default_trend_window() -> usize {
    100
}

fn default_trend_divergence() -> f64 {
    0.10
}

fn default_min_hour_samples() -> u32 {
    5
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            trend_window: default_trend_window(),
            trend_divergence: default_trend_divergence(),
            min_hour_samples: default_min_hour_samples(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.momentum.window, 20);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.budget.trigger_tokens, 8000);
        assert_eq!(config.followups.stuck_after_days, 7);
        assert_eq!(config.proactive.per_channel_daily_limit, 3);
    }

    #[test]
    fn sections_override_individually() {
        let config: AppConfig = toml::from_str(
            r#"
            [provider]
            api_key = "sk-test"
            model = "local/llama"

            [scheduler]
            tick_interval_secs = 5

            [breaker]
            open_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.provider.model, "local/llama");
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert_eq!(config.breaker.open_secs, 10);
        // Untouched sections still default.
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.momentum.hot_max_gap_mins, 15);
    }
}
