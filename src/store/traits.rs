//! Unified `SubtaskStore` trait — single async interface for all persistence.
//!
//! The one synchronization primitive the engine depends on is
//! [`SubtaskStore::compare_and_swap`]: an atomic token-guarded write of a
//! subtask row plus its timeline event. Everything else is plain reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::subtasks::model::{Subtask, TimelineEvent};
use crate::tasks::Task;

/// Backend-agnostic store covering tasks, subtasks, and timeline events.
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    // ── Subtasks ────────────────────────────────────────────────────

    /// Insert a new subtask.
    async fn insert_subtask(&self, subtask: &Subtask) -> Result<(), DatabaseError>;

    /// Get a subtask by ID.
    async fn get_subtask(&self, id: Uuid) -> Result<Option<Subtask>, DatabaseError>;

    /// Oldest pending subtasks (FIFO by `created_at`), optionally
    /// restricted to an owning-task type the provider is eligible for.
    async fn list_pending_oldest(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Subtask>, DatabaseError>;

    /// Leased subtasks whose `next_heartbeat_due_at` has passed.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Subtask>, DatabaseError>;

    /// Atomically replace a subtask row if its stored concurrency token
    /// still equals `expected_token`, appending `event` (when given) in
    /// the same transaction.
    ///
    /// Returns `true` if the swap won, `false` if another writer got
    /// there first. `subtask.concurrency_token` must already carry the
    /// new (bumped) value.
    async fn compare_and_swap(
        &self,
        expected_token: i64,
        subtask: &Subtask,
        event: Option<&TimelineEvent>,
    ) -> Result<bool, DatabaseError>;

    // ── Read models ─────────────────────────────────────────────────

    /// Timeline events for one subtask, newest first.
    async fn get_timeline(&self, subtask_id: Uuid) -> Result<Vec<TimelineEvent>, DatabaseError>;

    /// Number of subtasks currently claimable (pending).
    async fn count_pending(&self) -> Result<u64, DatabaseError>;
}
