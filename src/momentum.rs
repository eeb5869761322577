use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use crate::config::MomentumConfig;
use crate::types::MomentumClass;

/// Classifies channel cadence from recent message timing and gates how
/// likely a full decision cycle is to run at all.
///
/// The tracker never decides definitively by itself: failing the Bernoulli
/// draw is a legitimate terminal outcome ("gated": the generator was never
/// invoked), distinct from an invoked-but-declined cycle.
pub struct MomentumTracker {
    config: MomentumConfig,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl MomentumTracker {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message timestamp into the channel's bounded window.
    pub fn observe(&self, channel_id: &str, timestamp: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(channel_id.to_string()).or_default();
        window.push_back(timestamp);
        while window.len() > self.config.window {
            window.pop_front();
        }
    }

    pub fn classify(&self, channel_id: &str) -> MomentumClass {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps: Vec<DateTime<Utc>> = windows
            .get(channel_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default();
        classify_timestamps(&timestamps, &self.config)
    }

    pub fn response_probability(&self, class: MomentumClass) -> f64 {
        match class {
            MomentumClass::Cold => self.config.cold_probability,
            MomentumClass::Warm => self.config.warm_probability,
            MomentumClass::Hot => self.config.hot_probability,
        }
    }

    /// Bernoulli draw against the class probability. `false` means the
    /// cycle terminates as gated without touching the generator.
    pub fn gate(&self, channel_id: &str) -> (MomentumClass, bool) {
        let class = self.classify(channel_id);
        let p = self.response_probability(class);
        let draw: f64 = rand::thread_rng().gen();
        let passed = draw < p;
        debug!(
            channel = %channel_id,
            momentum = %class,
            probability = p,
            passed,
            "Momentum gate"
        );
        (class, passed)
    }
}

/// Mean inter-message gap over the window decides the class. Fewer than two
/// timestamps means no measurable cadence: cold.
fn classify_timestamps(timestamps: &[DateTime<Utc>], config: &MomentumConfig) -> MomentumClass {
    if timestamps.len() < 2 {
        return MomentumClass::Cold;
    }
    let mut sorted: Vec<DateTime<Utc>> = timestamps.to_vec();
    sorted.sort();

    let total_gap_secs: i64 = sorted
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds().max(0))
        .sum();
    let mean_gap_mins = total_gap_secs as f64 / (sorted.len() - 1) as f64 / 60.0;

    if mean_gap_mins < config.hot_max_gap_mins as f64 {
        MomentumClass::Hot
    } else if mean_gap_mins < config.warm_max_gap_mins as f64 {
        MomentumClass::Warm
    } else {
        MomentumClass::Cold
    }
}
