use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ProactiveConfig;
use crate::engagement::EngagementTracker;
use crate::state::{empty_object, read_modify_write};
use crate::traits::{MessageStore, StateStore};
use crate::types::ChannelQuota;

const COLLECTION_KEY: &str = "quotas";

/// Detects idle channels worth a bot-initiated message, gated by daily
/// quotas and engagement history.
///
/// Four independent gates, evaluated cheapest first (quota, attempt gap,
/// success rate, idle time) so a channel that is out of budget costs no
/// further state reads. A failed quota gate is expected control flow, not
/// a failure; it logs at debug.
pub struct ProactiveOpportunityFinder {
    store: Arc<dyn StateStore>,
    engagement: Arc<EngagementTracker>,
    messages: Arc<dyn MessageStore>,
    config: ProactiveConfig,
}

impl ProactiveOpportunityFinder {
    pub fn new(
        store: Arc<dyn StateStore>,
        engagement: Arc<EngagementTracker>,
        messages: Arc<dyn MessageStore>,
        config: ProactiveConfig,
    ) -> Self {
        Self {
            store,
            engagement,
            messages,
            config,
        }
    }

    /// Channels currently worth a proactive message, in no particular order.
    pub async fn find_opportunities(
        &self,
        allowed_channels: &[String],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }

        let quotas = match self.store.read_collection(COLLECTION_KEY).await {
            Ok(read) => read.body,
            Err(e) => {
                warn!(error = %e, "Failed to read quotas, skipping proactive scan");
                return Vec::new();
            }
        };

        let today = day_bucket(now);
        let mut global_attempts = global_attempts_today(&quotas, &today);
        let mut opportunities = Vec::new();

        for channel_id in allowed_channels {
            if global_attempts >= self.config.global_daily_limit {
                debug!("Global proactive quota exhausted for today");
                break;
            }
            if self.passes_gates(&quotas, channel_id, &today, now).await {
                // Count against the global budget within this scan so one
                // pass cannot overshoot it.
                global_attempts += 1;
                opportunities.push(channel_id.clone());
            }
        }

        opportunities
    }

    async fn passes_gates(
        &self,
        quotas: &serde_json::Value,
        channel_id: &str,
        today: &str,
        now: DateTime<Utc>,
    ) -> bool {
        // Gate 1: per-channel daily quota.
        let quota = channel_quota(quotas, channel_id, today);
        if quota.attempts_today >= self.config.per_channel_daily_limit {
            debug!(channel = %channel_id, attempts = quota.attempts_today, "Channel quota exhausted");
            return false;
        }

        // Gate 2: minimum gap since the last proactive attempt. The gap
        // check uses the real last attempt time, not the day bucket.
        if let Some(last) = quota.last_attempt_at {
            if now - last < Duration::minutes(self.config.min_gap_mins) {
                debug!(channel = %channel_id, "Within minimum proactive gap");
                return false;
            }
        }

        // Gate 3: engagement success rate, once enough attempts exist to
        // judge. New channels pass so the rate can bootstrap.
        let attempts = self.engagement.total_attempts(channel_id).await;
        if attempts >= self.config.rate_gate_min_attempts {
            let rate = self
                .engagement
                .success_rate(channel_id)
                .await
                .unwrap_or(0.0);
            if rate < self.config.success_rate_threshold {
                debug!(channel = %channel_id, rate, "Engagement rate below threshold");
                return false;
            }
        }

        // Gate 4: idle window.
        let Some(last_message) = self.messages.last_message_at(channel_id).await else {
            return false;
        };
        let idle = now - last_message;
        if idle < Duration::minutes(self.config.min_idle_mins)
            || idle > Duration::minutes(self.config.max_idle_mins)
        {
            debug!(
                channel = %channel_id,
                idle_mins = idle.num_minutes(),
                "Idle time outside proactive window"
            );
            return false;
        }

        true
    }

    /// Charge one proactive attempt against the channel and global budgets
    /// and feed the engagement history. Returns the attempt's ordinal
    /// within the channel's current day bucket (1-based).
    pub async fn record_attempt(&self, channel_id: &str, now: DateTime<Utc>) -> u32 {
        let today = day_bucket(now);
        let channel = channel_id.to_string();
        let result = read_modify_write(self.store.as_ref(), COLLECTION_KEY, empty_object, |body| {
            let mut quota = channel_quota(body, &channel, &today);
            quota.attempts_today += 1;
            quota.last_attempt_at = Some(now);
            let ordinal = quota.attempts_today;
            body["channels"][&channel] = json!(quota);

            let global = global_attempts_today(body, &today);
            body["global"] = json!({ "day": today, "attempts": global + 1 });
            ordinal
        })
        .await;

        self.engagement.record_attempt(channel_id, now).await;

        match result {
            Ok(ordinal) => ordinal,
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "Failed to record proactive attempt");
                1
            }
        }
    }
}

/// Wall-clock day bucket. Quota reset is this pure function of `now`: a
/// read under a new bucket simply starts from zero, no scheduled job.
pub fn day_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn channel_quota(quotas: &serde_json::Value, channel_id: &str, today: &str) -> ChannelQuota {
    let stored: Option<ChannelQuota> =
        serde_json::from_value(quotas["channels"][channel_id].clone()).ok();
    match stored {
        Some(q) if q.day == today => q,
        // Day rolled over (or first sighting): attempts reset, but the
        // last attempt timestamp survives for the gap gate.
        Some(q) => ChannelQuota {
            channel_id: channel_id.to_string(),
            day: today.to_string(),
            attempts_today: 0,
            last_attempt_at: q.last_attempt_at,
        },
        None => ChannelQuota {
            channel_id: channel_id.to_string(),
            day: today.to_string(),
            attempts_today: 0,
            last_attempt_at: None,
        },
    }
}

fn global_attempts_today(quotas: &serde_json::Value, today: &str) -> u32 {
    if quotas["global"]["day"].as_str() == Some(today) {
        quotas["global"]["attempts"].as_u64().unwrap_or(0) as u32
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngagementConfig;
    use crate::messages::InMemoryMessageStore;
    use crate::state::SqliteStateStore;
    use crate::types::Message;

    struct Fixture {
        finder: ProactiveOpportunityFinder,
        messages: Arc<InMemoryMessageStore>,
        engagement: Arc<EngagementTracker>,
    }

    async fn fixture(config: ProactiveConfig) -> Fixture {
        let store: Arc<SqliteStateStore> = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let engagement = Arc::new(EngagementTracker::new(
            store.clone(),
            EngagementConfig::default(),
        ));
        let messages = Arc::new(InMemoryMessageStore::new(100));
        let finder = ProactiveOpportunityFinder::new(
            store,
            engagement.clone(),
            messages.clone(),
            config,
        );
        Fixture {
            finder,
            messages,
            engagement,
        }
    }

    async fn seed_message(messages: &InMemoryMessageStore, channel: &str, at: DateTime<Utc>) {
        messages
            .append(Message {
                id: 1,
                channel_id: channel.to_string(),
                author_id: "user".to_string(),
                timestamp: at,
                content: "hi".to_string(),
                has_attachments: false,
            })
            .await;
    }

    fn quiet_config() -> ProactiveConfig {
        ProactiveConfig {
            min_idle_mins: 60,
            max_idle_mins: 10_000,
            min_gap_mins: 0,
            ..ProactiveConfig::default()
        }
    }

    #[tokio::test]
    async fn idle_channel_is_an_opportunity() {
        let f = fixture(quiet_config()).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::hours(3)).await;

        let found = f.finder.find_opportunities(&["chan".into()], now).await;
        assert_eq!(found, vec!["chan".to_string()]);
    }

    #[tokio::test]
    async fn recently_active_channel_is_skipped() {
        let f = fixture(quiet_config()).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::minutes(5)).await;

        assert!(f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn long_dead_channel_is_skipped() {
        let f = fixture(quiet_config()).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::days(30)).await;

        assert!(f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn fourth_attempt_waits_for_day_rollover() {
        let f = fixture(quiet_config()).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::hours(3)).await;

        for _ in 0..3 {
            assert!(!f
                .finder
                .find_opportunities(&["chan".into()], now)
                .await
                .is_empty());
            f.finder.record_attempt("chan", now).await;
        }

        // Quota spent for today.
        assert!(f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());

        // The next day-bucket starts fresh. Re-seed activity so the idle
        // window still fits.
        let tomorrow = now + Duration::days(1);
        seed_message(&f.messages, "chan", tomorrow - Duration::hours(3)).await;
        assert!(!f
            .finder
            .find_opportunities(&["chan".into()], tomorrow)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn global_quota_caps_one_scan() {
        let config = ProactiveConfig {
            global_daily_limit: 2,
            ..quiet_config()
        };
        let f = fixture(config).await;
        let now = Utc::now();
        for chan in ["a", "b", "c"] {
            seed_message(&f.messages, chan, now - Duration::hours(3)).await;
        }

        let found = f
            .finder
            .find_opportunities(&["a".into(), "b".into(), "c".into()], now)
            .await;
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn minimum_gap_blocks_bursty_repeats() {
        let config = ProactiveConfig {
            min_gap_mins: 240,
            ..quiet_config()
        };
        let f = fixture(config).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::hours(3)).await;

        f.finder
            .record_attempt("chan", now - Duration::minutes(30))
            .await;
        assert!(f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn low_success_rate_blocks_once_sampled() {
        let config = ProactiveConfig {
            rate_gate_min_attempts: 5,
            success_rate_threshold: 0.3,
            ..quiet_config()
        };
        let f = fixture(config).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::hours(3)).await;

        // Five ignored attempts: rate 0.0 with enough samples to judge.
        for _ in 0..5 {
            f.engagement
                .record_attempt("chan", now - Duration::days(2))
                .await;
        }
        assert!(f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unsampled_channel_passes_rate_gate() {
        let f = fixture(quiet_config()).await;
        let now = Utc::now();
        seed_message(&f.messages, "chan", now - Duration::hours(3)).await;

        // Two attempts, zero successes: below the sample minimum, so the
        // rate gate stays open for bootstrapping.
        f.engagement.record_attempt("chan", now - Duration::days(2)).await;
        f.engagement.record_attempt("chan", now - Duration::days(2)).await;
        assert!(!f
            .finder
            .find_opportunities(&["chan".into()], now)
            .await
            .is_empty());
    }

    #[test]
    fn day_bucket_is_pure() {
        let t = DateTime::parse_from_rfc3339("2026-08-30T23:59:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(day_bucket(t), "2026-08-30");
        assert_eq!(day_bucket(t + Duration::minutes(2)), "2026-08-31");
    }
}
