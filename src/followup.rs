use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::FollowUpConfig;
use crate::state::{read_modify_write, StoreError};
use crate::traits::StateStore;
use crate::types::{FollowUp, FollowUpState, Priority};

const COLLECTION_KEY: &str = "followups";

/// Report from one cleanup pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired: u32,
    pub archived: u32,
}

/// State machine over reminder items, backed by the state store.
///
/// pending --(due-at reached)--> due --(claimed)--> executing
///   --(send succeeds)--> completed --(archive age)--> archived (deleted)
///
/// A guard path expires pending items stuck overdue past the configured
/// threshold. Every eligibility decision uses `due_at`: a future-dated
/// item survives cleanup no matter how old its `created_at` is.
pub struct FollowUpLifecycle {
    store: Arc<dyn StateStore>,
    config: FollowUpConfig,
}

impl FollowUpLifecycle {
    pub fn new(store: Arc<dyn StateStore>, config: FollowUpConfig) -> Self {
        Self { store, config }
    }

    pub async fn create(
        &self,
        user_id: &str,
        channel_id: &str,
        event: &str,
        context: &str,
        due_at: DateTime<Utc>,
        priority: Priority,
    ) -> Result<FollowUp, StoreError> {
        let item = FollowUp {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            event: event.to_string(),
            context: context.to_string(),
            created_at: Utc::now(),
            due_at,
            priority,
            state: FollowUpState::Pending,
            completed_at: None,
        };
        let stored = item.clone();
        read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
            let mut pending = decode_items(&body["pending"]);
            pending.push(stored.clone());
            body["pending"] = json!(pending);
        })
        .await?;
        info!(id = %item.id, channel = %item.channel_id, due_at = %item.due_at, "Follow-up created");
        Ok(item)
    }

    pub async fn pending(&self) -> Result<Vec<FollowUp>, StoreError> {
        let read = self.store.read_collection(COLLECTION_KEY).await?;
        Ok(decode_items(&read.body["pending"]))
    }

    /// Pending items whose due time has arrived.
    pub async fn due_items(&self, now: DateTime<Utc>) -> Result<Vec<FollowUp>, StoreError> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter(|f| f.state == FollowUpState::Pending && f.due_at <= now)
            .collect())
    }

    /// Atomically claim a due item for execution. Exactly one of any number
    /// of racing claimants gets `Some`; the losers observe the item already
    /// executing (or gone) and skip.
    pub async fn claim(&self, id: &str) -> Result<Option<FollowUp>, StoreError> {
        let id = id.to_string();
        let claimed =
            read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
                let mut pending = decode_items(&body["pending"]);
                let claimed = match pending
                    .iter_mut()
                    .find(|f| f.id == id && f.state == FollowUpState::Pending)
                {
                    Some(item) => {
                        item.state = FollowUpState::Executing;
                        Some(item.clone())
                    }
                    None => None,
                };
                body["pending"] = json!(pending);
                claimed
            })
            .await?;

        if claimed.is_none() {
            debug!(id = %id, "Follow-up claim lost: already executing or gone");
        }
        Ok(claimed)
    }

    /// Completion moves the item from the pending collection to the
    /// completed collection in one store write.
    pub async fn complete(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let id = id.to_string();
        read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
            let mut pending = decode_items(&body["pending"]);
            let mut completed = decode_items(&body["completed"]);
            if let Some(pos) = pending.iter().position(|f| f.id == id) {
                let mut item = pending.remove(pos);
                item.state = FollowUpState::Completed;
                item.completed_at = Some(now);
                completed.push(item);
            }
            body["pending"] = json!(pending);
            body["completed"] = json!(completed);
        })
        .await
    }

    /// Return a claimed item to pending after a failed execution so a later
    /// tick retries it (until the stuck threshold expires it).
    pub async fn release(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
            let mut pending = decode_items(&body["pending"]);
            if let Some(item) = pending
                .iter_mut()
                .find(|f| f.id == id && f.state == FollowUpState::Executing)
            {
                item.state = FollowUpState::Pending;
            }
            body["pending"] = json!(pending);
        })
        .await
    }

    /// Startup recovery: anything left executing by a crash goes back to
    /// pending.
    pub async fn recover_interrupted(&self) -> Result<u32, StoreError> {
        let recovered =
            read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
                let mut pending = decode_items(&body["pending"]);
                let mut count = 0u32;
                for item in pending.iter_mut() {
                    if item.state == FollowUpState::Executing {
                        item.state = FollowUpState::Pending;
                        count += 1;
                    }
                }
                body["pending"] = json!(pending);
                count
            })
            .await?;
        if recovered > 0 {
            info!(count = recovered, "Recovered interrupted follow-ups");
        }
        Ok(recovered)
    }

    /// Expire stuck items and archive old completed ones. Pending
    /// eligibility is judged by `due_at` only.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let stuck_cutoff = now - Duration::days(self.config.stuck_after_days);
        let archive_cutoff = now - Duration::days(self.config.archive_after_days);

        let report =
            read_modify_write(self.store.as_ref(), COLLECTION_KEY, default_body, |body| {
                let mut report = CleanupReport::default();
                let pending = decode_items(&body["pending"]);
                let mut kept = Vec::with_capacity(pending.len());
                for item in pending {
                    // Never compare created_at here: a follow-up due in the
                    // future must survive regardless of how old it is.
                    if item.due_at < stuck_cutoff {
                        warn!(
                            id = %item.id,
                            channel = %item.channel_id,
                            due_at = %item.due_at,
                            "Follow-up stuck past threshold, expiring"
                        );
                        report.expired += 1;
                    } else {
                        kept.push(item);
                    }
                }

                let completed = decode_items(&body["completed"]);
                let mut kept_completed = Vec::with_capacity(completed.len());
                for item in completed {
                    match item.completed_at {
                        Some(at) if at < archive_cutoff => report.archived += 1,
                        _ => kept_completed.push(item),
                    }
                }

                body["pending"] = json!(kept);
                body["completed"] = json!(kept_completed);
                report
            })
            .await?;

        if report.expired > 0 || report.archived > 0 {
            info!(
                expired = report.expired,
                archived = report.archived,
                "Follow-up cleanup pass"
            );
        }
        Ok(report)
    }
}

fn default_body() -> serde_json::Value {
    json!({ "pending": [], "completed": [] })
}

fn decode_items(value: &serde_json::Value) -> Vec<FollowUp> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SqliteStateStore;

    async fn lifecycle() -> (FollowUpLifecycle, Arc<SqliteStateStore>) {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        (
            FollowUpLifecycle::new(store.clone(), FollowUpConfig::default()),
            store,
        )
    }

    async fn create_due(
        lc: &FollowUpLifecycle,
        due_at: DateTime<Utc>,
    ) -> FollowUp {
        lc.create("user", "chan", "interview", "asked about prep", due_at, Priority::Medium)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn due_items_require_reached_due_time() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let due = create_due(&lc, now - Duration::minutes(1)).await;
        create_due(&lc, now + Duration::hours(2)).await;

        let items = lc.due_items(now).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, due.id);
    }

    #[tokio::test]
    async fn future_dated_item_survives_cleanup_regardless_of_age() {
        let (lc, store) = lifecycle().await;
        let now = Utc::now();
        // Created 20 days ago, due 10 days from now. The historical defect
        // purged this because it compared created_at, not due_at.
        let item = FollowUp {
            id: "old-but-future".to_string(),
            user_id: "user".to_string(),
            channel_id: "chan".to_string(),
            event: "anniversary".to_string(),
            context: String::new(),
            created_at: now - Duration::days(20),
            due_at: now + Duration::days(10),
            priority: Priority::High,
            state: FollowUpState::Pending,
            completed_at: None,
        };
        store
            .write_collection(
                "followups",
                &json!({ "pending": [item], "completed": [] }),
                0,
            )
            .await
            .unwrap();

        lc.cleanup(now).await.unwrap();
        let pending = lc.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "old-but-future");
    }

    #[tokio::test]
    async fn stuck_items_expire_and_fresh_overdue_items_survive() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let stuck = create_due(&lc, now - Duration::days(8)).await;
        let fresh = create_due(&lc, now - Duration::days(3)).await;

        let report = lc.cleanup(now).await.unwrap();
        assert_eq!(report.expired, 1);

        let pending = lc.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, fresh.id);
        assert!(pending.iter().all(|f| f.id != stuck.id));
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let item = create_due(&lc, now - Duration::minutes(1)).await;

        let first = lc.claim(&item.id).await.unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().state, FollowUpState::Executing);

        let second = lc.claim(&item.id).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_winner() {
        let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());
        let lc = Arc::new(FollowUpLifecycle::new(store, FollowUpConfig::default()));
        let now = Utc::now();
        let item = create_due(&lc, now - Duration::minutes(1)).await;

        let a = {
            let lc = lc.clone();
            let id = item.id.clone();
            tokio::spawn(async move { lc.claim(&id).await.unwrap() })
        };
        let b = {
            let lc = lc.clone();
            let id = item.id.clone();
            tokio::spawn(async move { lc.claim(&id).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(
            a.is_some() as u32 + b.is_some() as u32,
            1,
            "exactly one claim must win"
        );
    }

    #[tokio::test]
    async fn complete_moves_item_in_one_write() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let item = create_due(&lc, now - Duration::minutes(1)).await;

        lc.claim(&item.id).await.unwrap().unwrap();
        lc.complete(&item.id, now).await.unwrap();

        assert!(lc.pending().await.unwrap().is_empty());
        // Still present in the completed collection until archive age.
        let report = lc.cleanup(now).await.unwrap();
        assert_eq!(report.archived, 0);
    }

    #[tokio::test]
    async fn completed_items_archive_after_age() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let item = create_due(&lc, now - Duration::minutes(1)).await;

        lc.claim(&item.id).await.unwrap().unwrap();
        // Completed 31 days ago.
        lc.complete(&item.id, now - Duration::days(31)).await.unwrap();

        let report = lc.cleanup(now).await.unwrap();
        assert_eq!(report.archived, 1);
    }

    #[tokio::test]
    async fn release_returns_item_to_pending() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let item = create_due(&lc, now - Duration::minutes(1)).await;

        lc.claim(&item.id).await.unwrap().unwrap();
        lc.release(&item.id).await.unwrap();

        let again = lc.claim(&item.id).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn recover_interrupted_resets_executing_items() {
        let (lc, _store) = lifecycle().await;
        let now = Utc::now();
        let a = create_due(&lc, now - Duration::minutes(1)).await;
        let b = create_due(&lc, now - Duration::minutes(1)).await;

        lc.claim(&a.id).await.unwrap().unwrap();
        lc.claim(&b.id).await.unwrap().unwrap();

        let recovered = lc.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 2);
        assert!(lc.due_items(now).await.unwrap().len() == 2);
    }
}
