//! Subtask data model — entities, status machine, and timeline events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current lifecycle status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    /// Whether this status is terminal (no further mutation accepted).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a provider currently holds a lease in this status.
    pub fn is_leased(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Legal state-machine edges. Everything else is rejected.
    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Assigned, Completed)
                | (Running, Completed)
                | (Assigned, Failed)
                | (Running, Failed)
                // reclaim / requeue
                | (Assigned, Pending)
                | (Running, Pending)
        )
    }

    /// Stable string form (matches the serde tag).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One independently assignable unit of GPU work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique ID.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Lifecycle status.
    pub status: SubtaskStatus,
    /// Current assignee; set only while leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_provider_id: Option<String>,
    /// Device of the current assignee; set only while leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Provider-reported progress, 0–100.
    pub progress: u8,
    /// Opaque execution parameters, passed through unmodified.
    pub parameters: serde_json::Value,
    /// Opaque execution-environment state, merged by environment updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<serde_json::Value>,
    /// Opaque results payload, stored on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    /// Reason recorded by the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Set when the work should re-enter the pool rather than terminate.
    /// Never `true` while leased.
    pub requires_reassignment: bool,
    /// Optimistic-concurrency version stamp; changes on every accepted
    /// mutation, never reused. Opaque to callers.
    pub concurrency_token: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Lease expiry; a leased subtask past this instant is reclaimable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_heartbeat_due_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// Create a new pending subtask for a task.
    pub fn new(task_id: Uuid, parameters: serde_json::Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            status: SubtaskStatus::Pending,
            assigned_provider_id: None,
            device_id: None,
            progress: 0,
            parameters,
            execution_state: None,
            results: None,
            failure_reason: None,
            requires_reassignment: false,
            concurrency_token: 0,
            created_at,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            last_heartbeat_at: None,
            next_heartbeat_due_at: None,
        }
    }

    /// Whether the lease has lapsed at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased()
            && self
                .next_heartbeat_due_at
                .map(|due| due < now)
                .unwrap_or(false)
    }
}

/// Kind of timeline event recorded for a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    Assigned,
    Started,
    Completed,
    Failed,
    FailedAndRequeued,
    ReclaimedExpiredLease,
    EnvironmentUpdated,
}

impl TimelineEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedAndRequeued => "failed_and_requeued",
            Self::ReclaimedExpiredLease => "reclaimed_expired_lease",
            Self::EnvironmentUpdated => "environment_updated",
        }
    }
}

/// Immutable audit record of one lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: Uuid,
    pub subtask_id: Uuid,
    pub event_type: TimelineEventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(
        subtask_id: Uuid,
        event_type: TimelineEventType,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subtask_id,
            event_type,
            message: message.into(),
            metadata: None,
            created_at,
        }
    }

    /// Attach structured metadata to the event.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial execution-environment update merged into `execution_state`.
///
/// At least one field must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onnx_model_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_gpu_preferred: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Map<String, serde_json::Value>>,
}

impl EnvironmentUpdate {
    /// Whether the update carries no fields at all.
    pub fn is_empty(&self) -> bool {
        self.onnx_model_ready.is_none()
            && self.web_gpu_preferred.is_none()
            && self.backend_type.is_none()
            && self.worker_type.is_none()
            && self.extra.as_ref().map(|m| m.is_empty()).unwrap_or(true)
    }

    /// Merge this update into an execution-state blob, returning the
    /// merged object. Unknown prior shape is replaced by an object.
    pub fn merge_into(&self, state: Option<&serde_json::Value>) -> serde_json::Value {
        let mut map = match state {
            Some(serde_json::Value::Object(m)) => m.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(v) = self.onnx_model_ready {
            map.insert("onnx_model_ready".into(), v.into());
        }
        if let Some(v) = self.web_gpu_preferred {
            map.insert("web_gpu_preferred".into(), v.into());
        }
        if let Some(ref v) = self.backend_type {
            map.insert("backend_type".into(), v.clone().into());
        }
        if let Some(ref v) = self.worker_type {
            map.insert("worker_type".into(), v.clone().into());
        }
        if let Some(ref extra) = self.extra {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_subtask_defaults() {
        let task_id = Uuid::new_v4();
        let sub = Subtask::new(task_id, serde_json::json!({"model": "resnet50"}), Utc::now());
        assert_eq!(sub.status, SubtaskStatus::Pending);
        assert_eq!(sub.concurrency_token, 0);
        assert_eq!(sub.progress, 0);
        assert!(sub.assigned_provider_id.is_none());
        assert!(sub.device_id.is_none());
        assert!(sub.next_heartbeat_due_at.is_none());
        assert!(!sub.requires_reassignment);
        assert_eq!(sub.task_id, task_id);
    }

    #[test]
    fn status_serde_snake_case() {
        let json = serde_json::to_string(&SubtaskStatus::Assigned).unwrap();
        assert_eq!(json, "\"assigned\"");

        let parsed: SubtaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, SubtaskStatus::Running);
    }

    #[test]
    fn legal_transitions() {
        use SubtaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Assigned.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
        assert!(Assigned.can_transition_to(Failed));
        assert!(Running.can_transition_to(Failed));
        assert!(Assigned.can_transition_to(Pending));
        assert!(Running.can_transition_to(Pending));
    }

    #[test]
    fn illegal_transitions() {
        use SubtaskStatus::*;
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Assigned));
        assert!(!Running.can_transition_to(Assigned));
    }

    #[test]
    fn terminal_statuses() {
        assert!(SubtaskStatus::Completed.is_terminal());
        assert!(SubtaskStatus::Failed.is_terminal());
        assert!(!SubtaskStatus::Pending.is_terminal());
        assert!(!SubtaskStatus::Assigned.is_terminal());
        assert!(!SubtaskStatus::Running.is_terminal());
    }

    #[test]
    fn lease_expiry_check() {
        let now = Utc::now();
        let mut sub = Subtask::new(Uuid::new_v4(), serde_json::json!({}), now);
        assert!(!sub.lease_expired(now));

        sub.status = SubtaskStatus::Assigned;
        sub.next_heartbeat_due_at = Some(now + chrono::Duration::seconds(60));
        assert!(!sub.lease_expired(now));
        assert!(sub.lease_expired(now + chrono::Duration::seconds(61)));

        // Pending subtasks never report an expired lease
        sub.status = SubtaskStatus::Pending;
        assert!(!sub.lease_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn event_type_serde_snake_case() {
        let json = serde_json::to_string(&TimelineEventType::ReclaimedExpiredLease).unwrap();
        assert_eq!(json, "\"reclaimed_expired_lease\"");

        let parsed: TimelineEventType = serde_json::from_str("\"failed_and_requeued\"").unwrap();
        assert_eq!(parsed, TimelineEventType::FailedAndRequeued);
    }

    #[test]
    fn environment_update_empty_detection() {
        assert!(EnvironmentUpdate::default().is_empty());

        let update = EnvironmentUpdate {
            backend_type: Some("wgpu".into()),
            ..Default::default()
        };
        assert!(!update.is_empty());

        // An `extra` object with no keys still counts as empty
        let update = EnvironmentUpdate {
            extra: Some(serde_json::Map::new()),
            ..Default::default()
        };
        assert!(update.is_empty());
    }

    #[test]
    fn environment_update_merge() {
        let prior = serde_json::json!({"backend_type": "cpu", "warmed_up": true});
        let mut extra = serde_json::Map::new();
        extra.insert("driver".into(), serde_json::json!("535.54"));
        let update = EnvironmentUpdate {
            onnx_model_ready: Some(true),
            backend_type: Some("wgpu".into()),
            extra: Some(extra),
            ..Default::default()
        };

        let merged = update.merge_into(Some(&prior));
        assert_eq!(merged["backend_type"], "wgpu");
        assert_eq!(merged["onnx_model_ready"], true);
        assert_eq!(merged["warmed_up"], true);
        assert_eq!(merged["driver"], "535.54");
        assert!(merged.get("web_gpu_preferred").is_none());
    }

    #[test]
    fn subtask_serde_omits_unset_fields() {
        let sub = Subtask::new(Uuid::new_v4(), serde_json::json!({}), Utc::now());
        let json = serde_json::to_string(&sub).unwrap();
        assert!(!json.contains("\"assigned_provider_id\""));
        assert!(!json.contains("\"results\""));
        assert!(!json.contains("\"next_heartbeat_due_at\""));
        assert!(json.contains("\"concurrency_token\":0"));
    }
}
