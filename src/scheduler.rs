use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::config::SchedulerConfig;
use crate::engagement::EngagementTracker;
use crate::followup::FollowUpLifecycle;
use crate::guard::{ClaimToken, ConcurrencyGuard};
use crate::momentum::MomentumTracker;
use crate::proactive::{day_bucket, ProactiveOpportunityFinder};
use crate::traits::{Event, EventReceiver, MessageStore};
use crate::types::{CycleOutcome, FollowUp, TriggerKind};

/// An inbound message within this window of a proactive send counts as
/// engagement with it.
const PROACTIVE_SUCCESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Top-level loop turning asynchronous events into at-most-one
/// decision-and-act cycle per trigger.
///
/// Two paths feed decision cycles: a periodic tick reviewing channels with
/// unreviewed messages (momentum-gated), and an immediate path for urgent
/// triggers that bypasses the gate. Both go through the concurrency guard;
/// nothing reads shared state before its claim succeeds. A global
/// semaphore caps simultaneous external calls.
pub struct ActionScheduler {
    config: SchedulerConfig,
    guard: Arc<ConcurrencyGuard>,
    momentum: Arc<MomentumTracker>,
    engagement: Arc<EngagementTracker>,
    followups: Arc<FollowUpLifecycle>,
    finder: Arc<ProactiveOpportunityFinder>,
    agent: Arc<Agent>,
    messages: Arc<dyn MessageStore>,
    /// Channels awaiting the next periodic review, with any urgent message
    /// ids queued behind a busy claim. Swapped-and-cleared atomically per
    /// tick so arrivals during processing start a fresh cycle.
    pending: Mutex<HashMap<String, Vec<u64>>>,
    /// Channels with a recent proactive send, awaiting an engagement signal.
    awaiting_engagement: Mutex<HashMap<String, Instant>>,
    semaphore: Arc<Semaphore>,
}

impl ActionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        guard: Arc<ConcurrencyGuard>,
        momentum: Arc<MomentumTracker>,
        engagement: Arc<EngagementTracker>,
        followups: Arc<FollowUpLifecycle>,
        finder: Arc<ProactiveOpportunityFinder>,
        agent: Arc<Agent>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            config,
            guard,
            momentum,
            engagement,
            followups,
            finder,
            agent,
            messages,
            pending: Mutex::new(HashMap::new()),
            awaiting_engagement: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Spawn the event listener and the tick loop.
    pub fn start(self: Arc<Self>, mut events: EventReceiver) {
        let listener = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => listener.clone().handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged; continuing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, listener stopping");
                        break;
                    }
                }
            }
        });

        let ticker = self;
        tokio::spawn(async move {
            let interval = Duration::from_secs(ticker.config.tick_interval_secs);
            loop {
                tokio::time::sleep(interval).await;
                ticker.clone().tick().await;
            }
        });
    }

    /// Ingest one inbound event. Urgent triggers claim immediately; a busy
    /// channel queues them (never drops, never runs concurrently).
    pub async fn handle_event(self: Arc<Self>, event: Event) {
        let channel_id = event.channel_id.clone();
        let message_id = event.message.id;

        self.messages.append(event.message.clone()).await;
        self.momentum.observe(&channel_id, event.message.timestamp);
        self.note_engagement(&channel_id).await;

        if !event.urgent {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.entry(channel_id).or_default();
            return;
        }

        // Reserve before claiming: even if this trigger has to wait for the
        // next tick, its message is excluded from every other cycle's
        // context read from this point on.
        self.guard.reserve_message(&channel_id, message_id);
        match self.guard.claim(&channel_id) {
            Some(token) => {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    scheduler
                        .execute_cycle(token, TriggerKind::Urgent, None, None)
                        .await;
                });
            }
            None => {
                debug!(
                    channel = %channel_id,
                    message_id,
                    outcome = %CycleOutcome::Busy,
                    "Channel busy, urgent trigger queued"
                );
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.entry(channel_id).or_default().push(message_id);
            }
        }
    }

    /// One periodic review pass. A failure in any channel's processing is
    /// logged and never aborts the rest of the batch.
    pub async fn tick(self: Arc<Self>) {
        let batch: HashMap<String, Vec<u64>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };

        for (channel_id, queued_urgent) in batch {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.review_channel(channel_id, queued_urgent).await;
            });
        }

        self.run_due_followups().await;

        if let Err(e) = self.followups.cleanup(Utc::now()).await {
            warn!(error = %e, "Follow-up cleanup failed");
        }

        self.run_proactive_scan().await;
    }

    /// Review one channel from the pending batch. Queued urgent triggers
    /// bypass the momentum gate; plain arrivals are gated.
    pub async fn review_channel(self: Arc<Self>, channel_id: String, queued_urgent: Vec<u64>) {
        let Some(token) = self.guard.claim(&channel_id) else {
            // Still busy: put the channel back for the next tick.
            debug!(channel = %channel_id, outcome = %CycleOutcome::Busy, "Review deferred");
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .entry(channel_id)
                .or_default()
                .extend(queued_urgent);
            return;
        };

        let trigger = if queued_urgent.is_empty() {
            let (class, passed) = self.momentum.gate(&channel_id);
            if !passed {
                info!(
                    channel = %channel_id,
                    momentum = %class,
                    outcome = %CycleOutcome::Gated,
                    "Cycle finished"
                );
                self.guard.release(token);
                return;
            }
            TriggerKind::Periodic
        } else {
            TriggerKind::Urgent
        };

        self.execute_cycle(token, trigger, None, None).await;
    }

    /// Claim and execute every due follow-up. Single-claim semantics: a
    /// racing scheduler's loser simply skips.
    pub async fn run_due_followups(self: &Arc<Self>) {
        let now = Utc::now();
        let due = match self.followups.due_items(now).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Failed to scan due follow-ups");
                return;
            }
        };

        for item in due {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_followup(item).await;
            });
        }
    }

    pub async fn run_followup(self: Arc<Self>, item: FollowUp) {
        let claimed = match self.followups.claim(&item.id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return, // lost the race, another tick has it
            Err(e) => {
                warn!(id = %item.id, error = %e, "Follow-up claim failed");
                return;
            }
        };

        let Some(token) = self.guard.claim(&claimed.channel_id) else {
            // Channel is mid-cycle; surrender the item claim and let the
            // next tick retry (first channel claim wins this round).
            if let Err(e) = self.followups.release(&claimed.id).await {
                warn!(id = %claimed.id, error = %e, "Failed to release follow-up");
            }
            return;
        };

        let note = format!(
            "Follow up with {} about \"{}\" (context: {}).",
            claimed.user_id, claimed.event, claimed.context
        );
        let send_key = format!("followup:{}", claimed.id);
        match self
            .execute_cycle(token, TriggerKind::FollowUpDue, Some(note), Some(send_key))
            .await
        {
            Some(CycleOutcome::Responded) => {
                if let Err(e) = self.followups.complete(&claimed.id, Utc::now()).await {
                    warn!(id = %claimed.id, error = %e, "Failed to complete follow-up");
                }
            }
            _ => {
                // Send did not happen; return to pending for a later tick.
                if let Err(e) = self.followups.release(&claimed.id).await {
                    warn!(id = %claimed.id, error = %e, "Failed to release follow-up");
                }
            }
        }
    }

    pub async fn run_proactive_scan(self: &Arc<Self>) {
        let channels = self.messages.channels().await;
        if channels.is_empty() {
            return;
        }
        let opportunities = self.finder.find_opportunities(&channels, Utc::now()).await;

        for channel_id in opportunities {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_proactive(channel_id).await;
            });
        }
    }

    pub async fn run_proactive(self: Arc<Self>, channel_id: String) {
        // First claim wins when a proactive opportunity and another trigger
        // target the same channel in the same tick; the loser skips.
        let Some(token) = self.guard.claim(&channel_id) else {
            debug!(channel = %channel_id, outcome = %CycleOutcome::Busy, "Proactive skipped");
            return;
        };

        let now = Utc::now();
        let attempt = self.finder.record_attempt(&channel_id, now).await;
        let note = "The channel has been quiet for a while; start a light, \
                    natural check-in if there is something worth saying."
            .to_string();
        // The logical send is attempt N of this channel's quota day.
        let send_key = format!(
            "proactive:{}:{}:{}",
            channel_id,
            day_bucket(now),
            attempt
        );
        let outcome = self
            .execute_cycle(token, TriggerKind::Proactive, Some(note), Some(send_key))
            .await;

        if matches!(outcome, Some(CycleOutcome::Responded)) {
            let mut awaiting = self
                .awaiting_engagement
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            awaiting.insert(channel_id, Instant::now());
        }
    }

    /// Run the agent on an already-claimed channel, always releasing the
    /// claim. Returns the outcome, or `None` when the cycle failed.
    ///
    /// `send_key` names the logical send for the idempotency ledger.
    /// Message-triggered cycles leave it `None` and it is derived from the
    /// newest message this cycle replies to.
    async fn execute_cycle(
        &self,
        token: ClaimToken,
        trigger: TriggerKind,
        note: Option<String>,
        send_key: Option<String>,
    ) -> Option<CycleOutcome> {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.guard.release(token);
                return None;
            }
        };

        // Reads happen here, strictly after the claim, filtered by the
        // in-flight set (minus this cycle's own messages).
        let channel_id = token.channel_id().to_string();
        let exclusions = self.guard.exclusions(&token);

        let send_key = match send_key {
            Some(key) => key,
            None => {
                let newest = self
                    .messages
                    .recent(&channel_id, 1, &exclusions)
                    .await
                    .last()
                    .map(|m| m.id)
                    .unwrap_or(0);
                format!("reply:{}:{}", channel_id, newest)
            }
        };

        let result = self
            .agent
            .run_cycle(&channel_id, trigger, &exclusions, note, &send_key)
            .await;

        self.guard.release(token);
        drop(permit);

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(channel = %channel_id, trigger = %trigger, error = %e, "Cycle failed");
                None
            }
        }
    }

    /// A user message landing soon after a proactive send counts as
    /// engagement with it.
    async fn note_engagement(&self, channel_id: &str) {
        let hit = {
            let mut awaiting = self
                .awaiting_engagement
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match awaiting.get(channel_id) {
                Some(sent_at) if sent_at.elapsed() <= PROACTIVE_SUCCESS_WINDOW => {
                    awaiting.remove(channel_id);
                    true
                }
                Some(_) => {
                    awaiting.remove(channel_id);
                    false
                }
                None => false,
            }
        };
        if hit {
            self.engagement.record_success(channel_id, Utc::now()).await;
        }
    }
}
