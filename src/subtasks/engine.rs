//! Leasing engine — claim-next selection and the explicit accept step.
//!
//! `claim_next` is the only internally retried operation: a lost
//! compare-and-swap race means another provider won that candidate, so
//! the engine re-selects rather than surfacing the race to the caller.
//! The observable contract is "return a subtask I now own, or none".

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::LeaseError;
use crate::store::SubtaskStore;
use crate::subtasks::heartbeat;
use crate::subtasks::model::{Subtask, SubtaskStatus, TimelineEvent, TimelineEventType};

pub struct LeaseEngine {
    store: Arc<dyn SubtaskStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LeaseEngine {
    pub fn new(store: Arc<dyn SubtaskStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Claim the oldest pending subtask for a provider.
    ///
    /// Returns `None` when nothing is claimable — a normal outcome,
    /// callers back off. Expired leases are reclaimed lazily first, so
    /// a crashed provider's work is claimable on the very next call.
    pub async fn claim_next(
        &self,
        provider_id: &str,
        device_id: &str,
        task_type: Option<&str>,
    ) -> Result<Option<Subtask>, LeaseError> {
        heartbeat::reclaim_expired(&self.store, &self.clock, self.config.reclaim_batch_size)
            .await?;

        for round in 0..self.config.claim_retry_limit {
            let candidates = self
                .store
                .list_pending_oldest(task_type, self.config.claim_batch_size)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            for candidate in candidates {
                let now = self.clock.now();
                let mut assigned = candidate.clone();
                assigned.status = SubtaskStatus::Assigned;
                assigned.assigned_provider_id = Some(provider_id.to_string());
                assigned.device_id = Some(device_id.to_string());
                assigned.assigned_at = Some(now);
                assigned.next_heartbeat_due_at = Some(now + self.config.default_grace);
                assigned.requires_reassignment = false;
                assigned.concurrency_token = candidate.concurrency_token + 1;

                let event = TimelineEvent::new(
                    candidate.id,
                    TimelineEventType::Assigned,
                    format!("Assigned to provider {provider_id}"),
                    now,
                )
                .with_metadata(serde_json::json!({
                    "provider_id": provider_id,
                    "device_id": device_id,
                }));

                if self
                    .store
                    .compare_and_swap(candidate.concurrency_token, &assigned, Some(&event))
                    .await?
                {
                    info!(
                        subtask_id = %assigned.id,
                        provider_id,
                        device_id,
                        "Subtask claimed"
                    );
                    return Ok(Some(assigned));
                }
                // Lost the race for this candidate; try the next one.
                debug!(subtask_id = %candidate.id, round, "Claim race lost, reselecting");
            }
        }

        // Every round lost every race; treat as an empty queue.
        Ok(None)
    }

    /// Explicit two-phase accept: transition an `Assigned` subtask,
    /// held by exactly this `(provider, device)` pair, to `Running`.
    ///
    /// Fails with `LeaseExpired` when the lease was reclaimed (or
    /// re-assigned) between claim and accept.
    pub async fn accept(
        &self,
        subtask_id: Uuid,
        provider_id: &str,
        device_id: &str,
    ) -> Result<Subtask, LeaseError> {
        let sub = self
            .store
            .get_subtask(subtask_id)
            .await?
            .ok_or(LeaseError::NotFound(subtask_id))?;

        if sub.status.is_terminal() {
            return Err(LeaseError::InvalidTransition {
                id: subtask_id,
                from: sub.status.to_string(),
                to: SubtaskStatus::Running.to_string(),
            });
        }
        let owned = sub.status == SubtaskStatus::Assigned
            && sub.assigned_provider_id.as_deref() == Some(provider_id)
            && sub.device_id.as_deref() == Some(device_id);
        if !owned {
            return Err(LeaseError::LeaseExpired { id: subtask_id });
        }

        let now = self.clock.now();
        let mut running = sub.clone();
        running.status = SubtaskStatus::Running;
        running.started_at = Some(now);
        // The provider just proved liveness; restart the grace window.
        running.next_heartbeat_due_at = Some(now + self.config.default_grace);
        running.concurrency_token = sub.concurrency_token + 1;

        let event = TimelineEvent::new(
            subtask_id,
            TimelineEventType::Started,
            format!("Accepted by provider {provider_id}"),
            now,
        )
        .with_metadata(serde_json::json!({
            "provider_id": provider_id,
            "device_id": device_id,
        }));

        if !self
            .store
            .compare_and_swap(sub.concurrency_token, &running, Some(&event))
            .await?
        {
            return Err(LeaseError::ConcurrencyConflict { id: subtask_id });
        }

        info!(subtask_id = %subtask_id, provider_id, "Subtask accepted");
        Ok(running)
    }
}
