use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use tracing::warn;

use crate::config::EngagementConfig;
use crate::state::{empty_object, read_modify_write, StoreError};
use crate::traits::StateStore;
use crate::types::{EngagementStat, Trend};

const COLLECTION_KEY: &str = "engagement";

/// Records proactive attempt/success history per channel and derives the
/// signals that gate future proactive engagement: success rate, trend
/// against the all-time rate, and best-performing hours of day.
pub struct EngagementTracker {
    store: Arc<dyn StateStore>,
    config: EngagementConfig,
}

impl EngagementTracker {
    pub fn new(store: Arc<dyn StateStore>, config: EngagementConfig) -> Self {
        Self { store, config }
    }

    /// Record an attempt. The outcome ring gets a pending failure entry;
    /// [`record_success`] flips it if the attempt lands.
    pub async fn record_attempt(&self, channel_id: &str, now: DateTime<Utc>) {
        let window = self.config.trend_window;
        let hour = now.hour() as usize;
        let result = self
            .mutate(channel_id, move |stat| {
                stat.total_attempts += 1;
                stat.hours[hour].0 += 1;
                stat.recent.push(false);
                while stat.recent.len() > window {
                    stat.recent.remove(0);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(channel = %channel_id, error = %e, "Failed to record engagement attempt");
        }
    }

    /// Record that the most recent attempt in this channel succeeded
    /// (the user engaged with the proactive message).
    pub async fn record_success(&self, channel_id: &str, now: DateTime<Utc>) {
        let hour = now.hour() as usize;
        let result = self
            .mutate(channel_id, move |stat| {
                stat.total_successes += 1;
                stat.hours[hour].1 += 1;
                if let Some(last_miss) = stat.recent.iter_mut().rev().find(|o| !**o) {
                    *last_miss = true;
                }
            })
            .await;
        if let Err(e) = result {
            warn!(channel = %channel_id, error = %e, "Failed to record engagement success");
        }
    }

    pub async fn stat(&self, channel_id: &str) -> EngagementStat {
        match self.store.read_collection(COLLECTION_KEY).await {
            Ok(read) => decode_stat(&read.body[channel_id]),
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "Failed to read engagement stats");
                EngagementStat::new()
            }
        }
    }

    /// All-time success rate. `None` until at least one attempt exists.
    pub async fn success_rate(&self, channel_id: &str) -> Option<f64> {
        let stat = self.stat(channel_id).await;
        rate(stat.total_successes, stat.total_attempts)
    }

    pub async fn total_attempts(&self, channel_id: &str) -> u32 {
        self.stat(channel_id).await.total_attempts
    }

    /// Trailing-window rate compared against the all-time rate.
    pub async fn trend(&self, channel_id: &str) -> Trend {
        let stat = self.stat(channel_id).await;
        trend_of(&stat, self.config.trend_divergence)
    }

    /// Hour-of-day buckets that outperform, best first. Buckets with fewer
    /// than the configured minimum attempts are ignored.
    pub async fn best_hours(&self, channel_id: &str) -> Vec<u32> {
        let stat = self.stat(channel_id).await;
        best_hours_of(&stat, self.config.min_hour_samples)
    }

    async fn mutate<F>(&self, channel_id: &str, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut EngagementStat),
    {
        let channel_id = channel_id.to_string();
        read_modify_write(self.store.as_ref(), COLLECTION_KEY, empty_object, |body| {
            let mut stat = decode_stat(&body[&channel_id]);
            f(&mut stat);
            body[&channel_id] = json!(stat);
        })
        .await
    }
}

/// Decode one stored stat, repairing the hour-bucket array: every reader
/// indexes hours 0..=23, and stored data may be shorter than that.
fn decode_stat(value: &serde_json::Value) -> EngagementStat {
    let mut stat: EngagementStat =
        serde_json::from_value(value.clone()).unwrap_or_else(|_| EngagementStat::new());
    if stat.hours.len() != 24 {
        stat.hours.resize(24, (0, 0));
    }
    stat
}

fn rate(successes: u32, attempts: u32) -> Option<f64> {
    if attempts == 0 {
        None
    } else {
        Some(successes as f64 / attempts as f64)
    }
}

fn trend_of(stat: &EngagementStat, divergence: f64) -> Trend {
    let Some(all_time) = rate(stat.total_successes, stat.total_attempts) else {
        return Trend::Stable;
    };
    if stat.recent.is_empty() {
        return Trend::Stable;
    }
    let recent_rate =
        stat.recent.iter().filter(|o| **o).count() as f64 / stat.recent.len() as f64;

    if recent_rate > all_time + divergence {
        Trend::Improving
    } else if recent_rate < all_time - divergence {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

fn best_hours_of(stat: &EngagementStat, min_samples: u32) -> Vec<u32> {
    let mut qualified: Vec<(u32, f64)> = stat
        .hours
        .iter()
        .enumerate()
        .filter(|(_, (attempts, _))| *attempts >= min_samples)
        .map(|(hour, (attempts, successes))| {
            (hour as u32, *successes as f64 / *attempts as f64)
        })
        .collect();
    qualified.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    qualified.into_iter().map(|(hour, _)| hour).collect()
}
