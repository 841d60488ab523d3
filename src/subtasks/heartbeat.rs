//! Heartbeat monitor — lease renewal and expired-lease reclamation.
//!
//! Expiry is enforced purely by comparing `next_heartbeat_due_at` to the
//! clock at read/claim time; the background sweep only improves
//! promptness. Reclaim is the sole recovery path for work held by
//! crashed or disconnected providers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::LeaseError;
use crate::store::SubtaskStore;
use crate::subtasks::lifecycle;
use crate::subtasks::model::{SubtaskStatus, TimelineEvent, TimelineEventType};

/// Successful heartbeat response: the renewed deadline and the token
/// the provider must present on its next call.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatAck {
    pub next_due_at: DateTime<Utc>,
    pub token: i64,
}

pub struct HeartbeatMonitor {
    store: Arc<dyn SubtaskStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<dyn SubtaskStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Renew the lease on a subtask.
    ///
    /// Routine beats append no timeline event (log-flood suppression).
    /// A beat arriving after the deadline reclaims the lease and fails
    /// with `LeaseExpired` — the subtask is not resurrected.
    pub async fn heartbeat(
        &self,
        subtask_id: Uuid,
        provider_id: &str,
        token: i64,
        grace: Option<Duration>,
        progress: Option<u8>,
    ) -> Result<HeartbeatAck, LeaseError> {
        if let Some(p) = progress {
            if p > 100 {
                return Err(LeaseError::Validation(format!(
                    "progress {p} out of range 0-100"
                )));
            }
        }

        let sub = self
            .store
            .get_subtask(subtask_id)
            .await?
            .ok_or(LeaseError::NotFound(subtask_id))?;

        let now = self.clock.now();
        if sub.lease_expired(now) {
            // Lapsed but not yet swept: reclaim now, then report it.
            reclaim_one(&self.store, &sub, now).await?;
            return Err(LeaseError::LeaseExpired { id: subtask_id });
        }

        lifecycle::verify_lease(&sub, provider_id, token, sub.status)?;

        let grace = self.config.effective_grace(grace);
        let mut renewed = sub.clone();
        renewed.last_heartbeat_at = Some(now);
        renewed.next_heartbeat_due_at = Some(now + grace);
        if let Some(p) = progress {
            renewed.progress = p;
        }
        renewed.concurrency_token = sub.concurrency_token + 1;

        if !self
            .store
            .compare_and_swap(sub.concurrency_token, &renewed, None)
            .await?
        {
            return Err(LeaseError::ConcurrencyConflict { id: subtask_id });
        }

        debug!(subtask_id = %subtask_id, provider_id, "Lease renewed");
        Ok(HeartbeatAck {
            next_due_at: renewed.next_heartbeat_due_at.unwrap_or(now),
            token: renewed.concurrency_token,
        })
    }
}

/// Reset one expired lease back to pending.
///
/// Losing the compare-and-swap here is fine: it means the provider beat
/// us to a mutation (or another sweep won), and the row's current state
/// stands.
async fn reclaim_one(
    store: &Arc<dyn SubtaskStore>,
    sub: &crate::subtasks::model::Subtask,
    now: DateTime<Utc>,
) -> Result<bool, LeaseError> {
    let mut reclaimed = sub.clone();
    reclaimed.status = SubtaskStatus::Pending;
    reclaimed.assigned_provider_id = None;
    reclaimed.device_id = None;
    reclaimed.next_heartbeat_due_at = None;
    reclaimed.requires_reassignment = true;
    reclaimed.progress = 0;
    reclaimed.concurrency_token = sub.concurrency_token + 1;

    let event = TimelineEvent::new(
        sub.id,
        TimelineEventType::ReclaimedExpiredLease,
        format!(
            "Lease expired for provider {}; returned to pending pool",
            sub.assigned_provider_id.as_deref().unwrap_or("unknown")
        ),
        now,
    )
    .with_metadata(serde_json::json!({
        "previous_provider_id": sub.assigned_provider_id,
        "previous_device_id": sub.device_id,
        "was_due_at": sub.next_heartbeat_due_at,
    }));

    let won = store
        .compare_and_swap(sub.concurrency_token, &reclaimed, Some(&event))
        .await?;
    if won {
        info!(
            subtask_id = %sub.id,
            previous_provider = sub.assigned_provider_id.as_deref().unwrap_or("unknown"),
            "Reclaimed expired lease"
        );
    }
    Ok(won)
}

/// Reclaim every lapsed lease, up to `limit` rows.
///
/// Invoked lazily from `claim_next` and periodically from the sweep
/// loop. Returns the number of subtasks returned to the pool.
pub async fn reclaim_expired(
    store: &Arc<dyn SubtaskStore>,
    clock: &Arc<dyn Clock>,
    limit: usize,
) -> Result<usize, LeaseError> {
    let now = clock.now();
    let expired = store.list_expired_leases(now, limit).await?;
    let mut reclaimed = 0;
    for sub in &expired {
        if reclaim_one(store, sub, now).await? {
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

/// Spawn the periodic reclaim sweep.
///
/// The first tick fires immediately, recovering leases orphaned by a
/// previous server run.
pub fn spawn_reclaim_loop(
    store: Arc<dyn SubtaskStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = config.sweep_interval.as_secs(),
            "Reclaim sweep loop started"
        );
        let mut tick = tokio::time::interval(config.sweep_interval);
        loop {
            tick.tick().await;
            match reclaim_expired(&store, &clock, config.reclaim_batch_size).await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "Sweep reclaimed expired leases"),
                Err(e) => warn!(error = %e, "Reclaim sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlStore;
    use crate::subtasks::engine::LeaseEngine;
    use crate::subtasks::model::Subtask;
    use crate::tasks::Task;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        store: Arc<dyn SubtaskStore>,
        clock: Arc<ManualClock>,
        lease: LeaseEngine,
        monitor: HeartbeatMonitor,
        task: Task,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn SubtaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = EngineConfig::default();
        let task = Task::new("t", "inference", clock.now());
        store.insert_task(&task).await.unwrap();
        let lease = LeaseEngine::new(
            Arc::clone(&store),
            clock.clone() as Arc<dyn Clock>,
            config.clone(),
        );
        let monitor = HeartbeatMonitor::new(
            Arc::clone(&store),
            clock.clone() as Arc<dyn Clock>,
            config,
        );
        Fixture {
            store,
            clock,
            lease,
            monitor,
            task,
        }
    }

    async fn claimed(fx: &Fixture) -> Subtask {
        let sub = Subtask::new(fx.task.id, serde_json::json!({}), fx.clock.now());
        fx.store.insert_subtask(&sub).await.unwrap();
        fx.lease.claim_next("prov-a", "dev-1", None).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn heartbeat_extends_lease_and_mints_token() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;
        let old_due = sub.next_heartbeat_due_at.unwrap();

        fx.clock.advance(ChronoDuration::seconds(30));
        let ack = fx
            .monitor
            .heartbeat(sub.id, "prov-a", sub.concurrency_token, None, Some(40))
            .await
            .unwrap();

        assert!(ack.next_due_at > old_due);
        assert_eq!(ack.token, sub.concurrency_token + 1);

        let stored = fx.store.get_subtask(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 40);
        assert!(stored.last_heartbeat_at.is_some());
        // Routine beats are not logged
        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert!(
            timeline
                .iter()
                .all(|e| e.event_type != TimelineEventType::ReclaimedExpiredLease)
        );
        assert_eq!(timeline.len(), 1); // only the Assigned event
    }

    #[tokio::test]
    async fn stale_token_never_extends_lease() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;
        let due_before = sub.next_heartbeat_due_at.unwrap();

        let err = fx
            .monitor
            .heartbeat(sub.id, "prov-a", sub.concurrency_token - 1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::ConcurrencyConflict { .. }));

        let stored = fx.store.get_subtask(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.next_heartbeat_due_at.unwrap(), due_before);
    }

    #[tokio::test]
    async fn requested_grace_is_capped() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;
        let now = fx.clock.now();

        let ack = fx
            .monitor
            .heartbeat(
                sub.id,
                "prov-a",
                sub.concurrency_token,
                Some(Duration::from_secs(86_400)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(ack.next_due_at, now + EngineConfig::default().max_grace);
    }

    #[tokio::test]
    async fn out_of_range_progress_rejected() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;
        let err = fx
            .monitor
            .heartbeat(sub.id, "prov-a", sub.concurrency_token, None, Some(101))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Validation(_)));
    }

    #[tokio::test]
    async fn late_heartbeat_reclaims_and_reports_expiry() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;

        fx.clock.advance(ChronoDuration::seconds(120));
        let err = fx
            .monitor
            .heartbeat(sub.id, "prov-a", sub.concurrency_token, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::LeaseExpired { .. }));

        let stored = fx.store.get_subtask(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubtaskStatus::Pending);
        assert!(stored.requires_reassignment);
        assert!(stored.assigned_provider_id.is_none());

        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert_eq!(
            timeline[0].event_type,
            TimelineEventType::ReclaimedExpiredLease
        );
    }

    #[tokio::test]
    async fn expired_lease_claimable_by_other_provider() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;
        let a_token = sub.concurrency_token;

        fx.clock.advance(ChronoDuration::seconds(120));
        let sweep_count =
            reclaim_expired(&fx.store, &(fx.clock.clone() as Arc<dyn Clock>), 64)
                .await
                .unwrap();
        assert_eq!(sweep_count, 1);

        let taken = fx.lease.claim_next("prov-b", "dev-2", None).await.unwrap().unwrap();
        assert_eq!(taken.id, sub.id);
        assert_eq!(taken.assigned_provider_id.as_deref(), Some("prov-b"));
        assert!(taken.concurrency_token > a_token);

        // Prior assignee's calls now fail with LeaseExpired
        let err = fx
            .monitor
            .heartbeat(sub.id, "prov-a", a_token, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::LeaseExpired { .. }));

        // Timeline: B's assignment recorded after the reclaim event
        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        let types: Vec<_> = timeline.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                TimelineEventType::Assigned,
                TimelineEventType::ReclaimedExpiredLease,
                TimelineEventType::Assigned,
            ]
        );
    }

    #[tokio::test]
    async fn heartbeat_legal_while_assigned_or_running() {
        let fx = fixture().await;
        let sub = claimed(&fx).await;

        // Assigned (pre-accept) heartbeat is a valid entry point
        let ack = fx
            .monitor
            .heartbeat(sub.id, "prov-a", sub.concurrency_token, None, None)
            .await
            .unwrap();

        let running = fx.lease.accept(sub.id, "prov-a", "dev-1").await.unwrap();
        assert_eq!(running.concurrency_token, ack.token + 1);

        fx.monitor
            .heartbeat(sub.id, "prov-a", running.concurrency_token, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reclaim_noop_when_nothing_expired() {
        let fx = fixture().await;
        let _sub = claimed(&fx).await;
        let count = reclaim_expired(&fx.store, &(fx.clock.clone() as Arc<dyn Clock>), 64)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
