//! Lifecycle transition validator — the central guard for every
//! mutating subtask operation, plus the terminal transitions
//! (complete, fail) and execution-environment updates.
//!
//! Check order is fixed and observable through the error taxonomy:
//! not-found, already-terminal, reclaimed, ownership, token, legal edge.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LeaseError;
use crate::store::SubtaskStore;
use crate::subtasks::model::{
    EnvironmentUpdate, Subtask, SubtaskStatus, TimelineEvent, TimelineEventType,
};

/// Verify that `provider_id`/`token` may mutate `sub` right now.
///
/// `requested` is the transition target, used only for error reporting
/// on terminal subtasks; pass the current status for operations that do
/// not change status (heartbeat, environment update).
///
/// Ownership resolution for non-assignees: a stale token means the
/// caller's view predates a reclaim, so the actionable answer is
/// `LeaseExpired` (re-claim, don't retry). A current token from a
/// non-assignee is a plain `OwnershipConflict`.
pub(crate) fn verify_lease(
    sub: &Subtask,
    provider_id: &str,
    token: i64,
    requested: SubtaskStatus,
) -> Result<(), LeaseError> {
    if sub.status.is_terminal() {
        return Err(LeaseError::InvalidTransition {
            id: sub.id,
            from: sub.status.to_string(),
            to: requested.to_string(),
        });
    }
    if sub.status == SubtaskStatus::Pending {
        // Reclaimed or requeued since the caller last saw it.
        return Err(LeaseError::LeaseExpired { id: sub.id });
    }
    if sub.assigned_provider_id.as_deref() != Some(provider_id) {
        if token != sub.concurrency_token {
            return Err(LeaseError::LeaseExpired { id: sub.id });
        }
        return Err(LeaseError::OwnershipConflict { id: sub.id });
    }
    if token != sub.concurrency_token {
        return Err(LeaseError::ConcurrencyConflict { id: sub.id });
    }
    Ok(())
}

/// Reject transitions outside the legal state machine.
pub(crate) fn ensure_edge(
    sub: &Subtask,
    requested: SubtaskStatus,
) -> Result<(), LeaseError> {
    if !sub.status.can_transition_to(requested) {
        return Err(LeaseError::InvalidTransition {
            id: sub.id,
            from: sub.status.to_string(),
            to: requested.to_string(),
        });
    }
    Ok(())
}

/// Terminal transitions and environment updates for leased subtasks.
pub struct LifecycleEngine {
    store: Arc<dyn SubtaskStore>,
    clock: Arc<dyn Clock>,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn SubtaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn fetch(&self, subtask_id: Uuid) -> Result<Subtask, LeaseError> {
        self.store
            .get_subtask(subtask_id)
            .await?
            .ok_or(LeaseError::NotFound(subtask_id))
    }

    /// Mark a subtask completed and store its results payload.
    ///
    /// A retry after success fails with `InvalidTransition` (already
    /// terminal); callers treat that as "already done".
    pub async fn complete(
        &self,
        subtask_id: Uuid,
        provider_id: &str,
        token: i64,
        results: serde_json::Value,
    ) -> Result<Subtask, LeaseError> {
        let sub = self.fetch(subtask_id).await?;
        verify_lease(&sub, provider_id, token, SubtaskStatus::Completed)?;
        ensure_edge(&sub, SubtaskStatus::Completed)?;

        let now = self.clock.now();
        let mut updated = sub.clone();
        updated.status = SubtaskStatus::Completed;
        updated.completed_at = Some(now);
        updated.results = Some(results);
        updated.progress = 100;
        // Assignment and deadline fields are only meaningful while leased
        updated.assigned_provider_id = None;
        updated.device_id = None;
        updated.next_heartbeat_due_at = None;
        updated.concurrency_token = sub.concurrency_token + 1;

        let event = TimelineEvent::new(
            subtask_id,
            TimelineEventType::Completed,
            format!("Completed by provider {provider_id}"),
            now,
        )
        .with_metadata(serde_json::json!({
            "provider_id": provider_id,
            "device_id": sub.device_id,
        }));

        if !self
            .store
            .compare_and_swap(sub.concurrency_token, &updated, Some(&event))
            .await?
        {
            return Err(LeaseError::ConcurrencyConflict { id: subtask_id });
        }

        info!(subtask_id = %subtask_id, provider_id, "Subtask completed");
        Ok(updated)
    }

    /// Record a failure.
    ///
    /// With `requires_reassignment` the subtask re-enters the pending
    /// pool (soft failure); otherwise it is terminally failed.
    pub async fn fail(
        &self,
        subtask_id: Uuid,
        provider_id: &str,
        token: i64,
        reason: &str,
        requires_reassignment: bool,
        metadata: Option<serde_json::Value>,
    ) -> Result<Subtask, LeaseError> {
        let sub = self.fetch(subtask_id).await?;
        let target = if requires_reassignment {
            SubtaskStatus::Pending
        } else {
            SubtaskStatus::Failed
        };
        verify_lease(&sub, provider_id, token, target)?;
        ensure_edge(&sub, target)?;

        let now = self.clock.now();
        let mut updated = sub.clone();
        updated.status = target;
        updated.failure_reason = Some(reason.to_string());
        updated.assigned_provider_id = None;
        updated.device_id = None;
        updated.next_heartbeat_due_at = None;
        updated.concurrency_token = sub.concurrency_token + 1;

        let event_type = if requires_reassignment {
            updated.requires_reassignment = true;
            updated.progress = 0;
            TimelineEventType::FailedAndRequeued
        } else {
            updated.failed_at = Some(now);
            updated.requires_reassignment = false;
            TimelineEventType::Failed
        };

        let mut event_metadata = serde_json::json!({
            "provider_id": provider_id,
            "reason": reason,
            "requires_reassignment": requires_reassignment,
        });
        if let (Some(obj), Some(serde_json::Value::Object(extra))) =
            (event_metadata.as_object_mut(), metadata)
        {
            for (k, v) in extra {
                obj.entry(k).or_insert(v);
            }
        }

        let event = TimelineEvent::new(
            subtask_id,
            event_type,
            format!("Failed on provider {provider_id}: {reason}"),
            now,
        )
        .with_metadata(event_metadata);

        if !self
            .store
            .compare_and_swap(sub.concurrency_token, &updated, Some(&event))
            .await?
        {
            return Err(LeaseError::ConcurrencyConflict { id: subtask_id });
        }

        info!(
            subtask_id = %subtask_id,
            provider_id,
            reason,
            requeued = requires_reassignment,
            "Subtask failed"
        );
        Ok(updated)
    }

    /// Merge a partial execution-environment update into the subtask's
    /// execution-state blob. Status is unchanged; an empty update is
    /// rejected.
    pub async fn update_environment(
        &self,
        subtask_id: Uuid,
        provider_id: &str,
        token: i64,
        update: &EnvironmentUpdate,
    ) -> Result<Subtask, LeaseError> {
        if update.is_empty() {
            return Err(LeaseError::Validation(
                "environment update must carry at least one field".into(),
            ));
        }

        let sub = self.fetch(subtask_id).await?;
        verify_lease(&sub, provider_id, token, sub.status)?;

        let now = self.clock.now();
        let mut updated = sub.clone();
        updated.execution_state = Some(update.merge_into(sub.execution_state.as_ref()));
        updated.concurrency_token = sub.concurrency_token + 1;

        let event = TimelineEvent::new(
            subtask_id,
            TimelineEventType::EnvironmentUpdated,
            format!("Execution environment updated by provider {provider_id}"),
            now,
        )
        .with_metadata(serde_json::to_value(update).unwrap_or_default());

        if !self
            .store
            .compare_and_swap(sub.concurrency_token, &updated, Some(&event))
            .await?
        {
            return Err(LeaseError::ConcurrencyConflict { id: subtask_id });
        }

        debug!(subtask_id = %subtask_id, provider_id, "Environment updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::store::LibSqlStore;
    use crate::subtasks::engine::LeaseEngine;
    use crate::tasks::Task;
    use chrono::Utc;

    struct Fixture {
        store: Arc<dyn SubtaskStore>,
        clock: Arc<ManualClock>,
        lease: LeaseEngine,
        lifecycle: LifecycleEngine,
        task: Task,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn SubtaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let task = Task::new("t", "inference", clock.now());
        store.insert_task(&task).await.unwrap();
        let lease = LeaseEngine::new(
            Arc::clone(&store),
            clock.clone() as Arc<dyn Clock>,
            EngineConfig::default(),
        );
        let lifecycle = LifecycleEngine::new(Arc::clone(&store), clock.clone() as Arc<dyn Clock>);
        Fixture {
            store,
            clock,
            lease,
            lifecycle,
            task,
        }
    }

    async fn claimed_subtask(fx: &Fixture) -> Subtask {
        let sub = Subtask::new(fx.task.id, serde_json::json!({}), fx.clock.now());
        fx.store.insert_subtask(&sub).await.unwrap();
        fx.lease
            .claim_next("prov-a", "dev-1", None)
            .await
            .unwrap()
            .expect("claim should find the pending subtask")
    }

    #[tokio::test]
    async fn complete_stores_results_and_terminates() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let done = fx
            .lifecycle
            .complete(
                sub.id,
                "prov-a",
                sub.concurrency_token,
                serde_json::json!({"loss": 0.03}),
            )
            .await
            .unwrap();

        assert_eq!(done.status, SubtaskStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert!(done.assigned_provider_id.is_none());
        assert!(done.next_heartbeat_due_at.is_none());
        assert_eq!(done.results, Some(serde_json::json!({"loss": 0.03})));
        assert_eq!(done.concurrency_token, sub.concurrency_token + 1);

        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert_eq!(timeline[0].event_type, TimelineEventType::Completed);
    }

    #[tokio::test]
    async fn double_complete_is_invalid_transition_and_keeps_results() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;
        let token = sub.concurrency_token;

        fx.lifecycle
            .complete(sub.id, "prov-a", token, serde_json::json!({"v": 1}))
            .await
            .unwrap();

        // Retry with the same (now stale) token: terminal check fires
        // before the token check.
        let err = fx
            .lifecycle
            .complete(sub.id, "prov-a", token, serde_json::json!({"v": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::InvalidTransition { .. }));

        let stored = fx.store.get_subtask(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.results, Some(serde_json::json!({"v": 1})));
    }

    #[tokio::test]
    async fn stale_token_complete_is_concurrency_conflict() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let err = fx
            .lifecycle
            .complete(
                sub.id,
                "prov-a",
                sub.concurrency_token - 1,
                serde_json::json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn non_owner_with_current_token_is_ownership_conflict() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let err = fx
            .lifecycle
            .complete(sub.id, "prov-b", sub.concurrency_token, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::OwnershipConflict { .. }));
    }

    #[tokio::test]
    async fn hard_fail_is_terminal() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let failed = fx
            .lifecycle
            .fail(sub.id, "prov-a", sub.concurrency_token, "OOM", false, None)
            .await
            .unwrap();
        assert_eq!(failed.status, SubtaskStatus::Failed);
        assert!(failed.failed_at.is_some());
        assert!(!failed.requires_reassignment);
        assert_eq!(failed.failure_reason.as_deref(), Some("OOM"));

        // Never again claimable
        assert!(fx.lease.claim_next("prov-b", "d", None).await.unwrap().is_none());

        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert_eq!(timeline[0].event_type, TimelineEventType::Failed);
    }

    #[tokio::test]
    async fn soft_fail_requeues_and_is_claimable() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let requeued = fx
            .lifecycle
            .fail(
                sub.id,
                "prov-a",
                sub.concurrency_token,
                "OOM",
                true,
                Some(serde_json::json!({"vram_mb": 8192})),
            )
            .await
            .unwrap();
        assert_eq!(requeued.status, SubtaskStatus::Pending);
        assert!(requeued.requires_reassignment);
        assert!(requeued.assigned_provider_id.is_none());
        assert!(requeued.failed_at.is_none());

        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert_eq!(timeline[0].event_type, TimelineEventType::FailedAndRequeued);
        let meta = timeline[0].metadata.as_ref().unwrap();
        assert_eq!(meta["vram_mb"], 8192);

        // Immediately claimable by any provider
        let reclaimed = fx
            .lease
            .claim_next("prov-b", "dev-2", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, sub.id);
        assert!(!reclaimed.requires_reassignment);
    }

    #[tokio::test]
    async fn environment_update_merges_and_bumps_token() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let update = EnvironmentUpdate {
            onnx_model_ready: Some(true),
            backend_type: Some("webgpu".into()),
            ..Default::default()
        };
        let updated = fx
            .lifecycle
            .update_environment(sub.id, "prov-a", sub.concurrency_token, &update)
            .await
            .unwrap();

        assert_eq!(updated.status, sub.status);
        assert_eq!(updated.concurrency_token, sub.concurrency_token + 1);
        let state = updated.execution_state.unwrap();
        assert_eq!(state["onnx_model_ready"], true);
        assert_eq!(state["backend_type"], "webgpu");

        let timeline = fx.store.get_timeline(sub.id).await.unwrap();
        assert_eq!(timeline[0].event_type, TimelineEventType::EnvironmentUpdated);
    }

    #[tokio::test]
    async fn empty_environment_update_rejected() {
        let fx = fixture().await;
        let sub = claimed_subtask(&fx).await;

        let err = fx
            .lifecycle
            .update_environment(
                sub.id,
                "prov-a",
                sub.concurrency_token,
                &EnvironmentUpdate::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_subtask_is_not_found() {
        let fx = fixture().await;
        let err = fx
            .lifecycle
            .complete(Uuid::new_v4(), "prov-a", 0, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotFound(_)));
    }
}
