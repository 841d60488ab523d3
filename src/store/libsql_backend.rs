//! libSQL backend — async `SubtaskStore` trait implementation.
//!
//! Supports local file and in-memory databases. The compare-and-swap
//! write path runs the token-guarded UPDATE and the timeline-event
//! INSERT inside one transaction, so a transition and its audit record
//! are applied as a unit or not at all.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::SubtaskStore;
use crate::subtasks::model::{Subtask, SubtaskStatus, TimelineEvent, TimelineEventType};
use crate::tasks::Task;

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes transactions on the shared connection so concurrent
    /// BEGINs never interleave. Not a correctness guard — the token
    /// predicate in the UPDATE is what arbitrates writers, including
    /// writers in other processes.
    write_lock: tokio::sync::Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: tokio::sync::Mutex::new(()),
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            write_lock: tokio::sync::Mutex::new(()),
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const SUBTASK_COLUMNS: &str = "id, task_id, status, assigned_provider_id, device_id, progress, \
     parameters, execution_state, results, failure_reason, requires_reassignment, \
     concurrency_token, created_at, assigned_at, started_at, completed_at, failed_at, \
     last_heartbeat_at, next_heartbeat_due_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn str_to_status(s: &str) -> SubtaskStatus {
    match s {
        "assigned" => SubtaskStatus::Assigned,
        "running" => SubtaskStatus::Running,
        "completed" => SubtaskStatus::Completed,
        "failed" => SubtaskStatus::Failed,
        _ => SubtaskStatus::Pending,
    }
}

fn str_to_event_type(s: &str) -> TimelineEventType {
    match s {
        "started" => TimelineEventType::Started,
        "completed" => TimelineEventType::Completed,
        "failed" => TimelineEventType::Failed,
        "failed_and_requeued" => TimelineEventType::FailedAndRequeued,
        "reclaimed_expired_lease" => TimelineEventType::ReclaimedExpiredLease,
        "environment_updated" => TimelineEventType::EnvironmentUpdated,
        _ => TimelineEventType::Assigned,
    }
}

fn parse_json_column(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

/// Map a libsql Row to a Subtask. Column order matches SUBTASK_COLUMNS.
fn row_to_subtask(row: &libsql::Row) -> Result<Subtask, DatabaseError> {
    let err = |e: libsql::Error| DatabaseError::Query(format!("subtask row: {e}"));

    let id_str: String = row.get(0).map_err(err)?;
    let task_id_str: String = row.get(1).map_err(err)?;
    let status_str: String = row.get(2).map_err(err)?;
    let assigned_provider_id: Option<String> = row.get(3).map_err(err)?;
    let device_id: Option<String> = row.get(4).map_err(err)?;
    let progress: i64 = row.get(5).map_err(err)?;
    let parameters_str: String = row.get(6).map_err(err)?;
    let execution_state: Option<String> = row.get(7).map_err(err)?;
    let results: Option<String> = row.get(8).map_err(err)?;
    let failure_reason: Option<String> = row.get(9).map_err(err)?;
    let requires_reassignment: i64 = row.get(10).map_err(err)?;
    let concurrency_token: i64 = row.get(11).map_err(err)?;
    let created_str: String = row.get(12).map_err(err)?;
    let assigned_str: Option<String> = row.get(13).map_err(err)?;
    let started_str: Option<String> = row.get(14).map_err(err)?;
    let completed_str: Option<String> = row.get(15).map_err(err)?;
    let failed_str: Option<String> = row.get(16).map_err(err)?;
    let heartbeat_str: Option<String> = row.get(17).map_err(err)?;
    let due_str: Option<String> = row.get(18).map_err(err)?;

    Ok(Subtask {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("subtask id: {e}")))?,
        task_id: Uuid::parse_str(&task_id_str)
            .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?,
        status: str_to_status(&status_str),
        assigned_provider_id,
        device_id,
        progress: progress.clamp(0, 100) as u8,
        parameters: serde_json::from_str(&parameters_str)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        execution_state: parse_json_column(execution_state),
        results: parse_json_column(results),
        failure_reason,
        requires_reassignment: requires_reassignment != 0,
        concurrency_token,
        created_at: parse_datetime(&created_str),
        assigned_at: parse_optional_datetime(assigned_str),
        started_at: parse_optional_datetime(started_str),
        completed_at: parse_optional_datetime(completed_str),
        failed_at: parse_optional_datetime(failed_str),
        last_heartbeat_at: parse_optional_datetime(heartbeat_str),
        next_heartbeat_due_at: parse_optional_datetime(due_str),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<TimelineEvent, DatabaseError> {
    let err = |e: libsql::Error| DatabaseError::Query(format!("event row: {e}"));

    let id_str: String = row.get(0).map_err(err)?;
    let subtask_id_str: String = row.get(1).map_err(err)?;
    let event_type_str: String = row.get(2).map_err(err)?;
    let message: String = row.get(3).map_err(err)?;
    let metadata: Option<String> = row.get(4).map_err(err)?;
    let created_str: String = row.get(5).map_err(err)?;

    Ok(TimelineEvent {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("event id: {e}")))?,
        subtask_id: Uuid::parse_str(&subtask_id_str)
            .map_err(|e| DatabaseError::Serialization(format!("event subtask id: {e}")))?,
        event_type: str_to_event_type(&event_type_str),
        message,
        metadata: parse_json_column(metadata),
        created_at: parse_datetime(&created_str),
    })
}

fn json_to_string(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn optional_json_to_string(
    value: Option<&serde_json::Value>,
) -> Result<Option<String>, DatabaseError> {
    value.map(json_to_string).transpose()
}

#[async_trait]
impl SubtaskStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (id, name, task_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                task.id.to_string(),
                task.name.as_str(),
                task.task_type.as_str(),
                task.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(id = %task.id, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, name, task_type, created_at FROM tasks WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;
                let name: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;
                let task_type: String = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;
                let created_str: String = row
                    .get(3)
                    .map_err(|e| DatabaseError::Query(format!("task row: {e}")))?;
                Ok(Some(Task {
                    id: Uuid::parse_str(&id_str)
                        .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?,
                    name,
                    task_type,
                    created_at: parse_datetime(&created_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    // ── Subtasks ────────────────────────────────────────────────────

    async fn insert_subtask(&self, subtask: &Subtask) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO subtasks ({SUBTASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                subtask.id.to_string(),
                subtask.task_id.to_string(),
                subtask.status.as_str(),
                subtask.assigned_provider_id.as_deref(),
                subtask.device_id.as_deref(),
                subtask.progress as i64,
                json_to_string(&subtask.parameters)?,
                optional_json_to_string(subtask.execution_state.as_ref())?,
                optional_json_to_string(subtask.results.as_ref())?,
                subtask.failure_reason.as_deref(),
                subtask.requires_reassignment as i64,
                subtask.concurrency_token,
                subtask.created_at.to_rfc3339(),
                subtask.assigned_at.map(|d| d.to_rfc3339()),
                subtask.started_at.map(|d| d.to_rfc3339()),
                subtask.completed_at.map(|d| d.to_rfc3339()),
                subtask.failed_at.map(|d| d.to_rfc3339()),
                subtask.last_heartbeat_at.map(|d| d.to_rfc3339()),
                subtask.next_heartbeat_due_at.map(|d| d.to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_subtask: {e}")))?;
        debug!(id = %subtask.id, task_id = %subtask.task_id, "Subtask created");
        Ok(())
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Option<Subtask>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_subtask: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subtask(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_subtask row: {e}"))),
        }
    }

    async fn list_pending_oldest(
        &self,
        task_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Subtask>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match task_type {
            Some(task_type) => conn
                .query(
                    &format!(
                        "SELECT {} FROM subtasks s
                         JOIN tasks t ON t.id = s.task_id
                         WHERE s.status = 'pending' AND t.task_type = ?1
                         ORDER BY s.created_at ASC LIMIT ?2",
                        qualified_subtask_columns()
                    ),
                    params![task_type, limit as i64],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list_pending_oldest: {e}")))?,
            None => conn
                .query(
                    &format!(
                        "SELECT {SUBTASK_COLUMNS} FROM subtasks
                         WHERE status = 'pending'
                         ORDER BY created_at ASC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("list_pending_oldest: {e}")))?,
        };

        let mut subtasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            subtasks.push(row_to_subtask(&row)?);
        }
        Ok(subtasks)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Subtask>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SUBTASK_COLUMNS} FROM subtasks
                     WHERE status IN ('assigned', 'running')
                       AND next_heartbeat_due_at IS NOT NULL
                       AND next_heartbeat_due_at < ?1
                     ORDER BY next_heartbeat_due_at ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expired_leases: {e}")))?;

        let mut subtasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            subtasks.push(row_to_subtask(&row)?);
        }
        Ok(subtasks)
    }

    async fn compare_and_swap(
        &self,
        expected_token: i64,
        subtask: &Subtask,
        event: Option<&TimelineEvent>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap begin: {e}")))?;

        let affected = tx
            .execute(
                "UPDATE subtasks SET
                    status = ?1,
                    assigned_provider_id = ?2,
                    device_id = ?3,
                    progress = ?4,
                    execution_state = ?5,
                    results = ?6,
                    failure_reason = ?7,
                    requires_reassignment = ?8,
                    concurrency_token = ?9,
                    assigned_at = ?10,
                    started_at = ?11,
                    completed_at = ?12,
                    failed_at = ?13,
                    last_heartbeat_at = ?14,
                    next_heartbeat_due_at = ?15
                 WHERE id = ?16 AND concurrency_token = ?17",
                params![
                    subtask.status.as_str(),
                    subtask.assigned_provider_id.as_deref(),
                    subtask.device_id.as_deref(),
                    subtask.progress as i64,
                    optional_json_to_string(subtask.execution_state.as_ref())?,
                    optional_json_to_string(subtask.results.as_ref())?,
                    subtask.failure_reason.as_deref(),
                    subtask.requires_reassignment as i64,
                    subtask.concurrency_token,
                    subtask.assigned_at.map(|d| d.to_rfc3339()),
                    subtask.started_at.map(|d| d.to_rfc3339()),
                    subtask.completed_at.map(|d| d.to_rfc3339()),
                    subtask.failed_at.map(|d| d.to_rfc3339()),
                    subtask.last_heartbeat_at.map(|d| d.to_rfc3339()),
                    subtask.next_heartbeat_due_at.map(|d| d.to_rfc3339()),
                    subtask.id.to_string(),
                    expected_token,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap update: {e}")))?;

        if affected == 0 {
            // Another writer won the race; leave the row untouched.
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("compare_and_swap rollback: {e}")))?;
            return Ok(false);
        }

        if let Some(event) = event {
            tx.execute(
                "INSERT INTO timeline_events (id, subtask_id, event_type, message, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.to_string(),
                    event.subtask_id.to_string(),
                    event.event_type.as_str(),
                    event.message.as_str(),
                    optional_json_to_string(event.metadata.as_ref())?,
                    event.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap event: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("compare_and_swap commit: {e}")))?;
        Ok(true)
    }

    // ── Read models ─────────────────────────────────────────────────

    async fn get_timeline(&self, subtask_id: Uuid) -> Result<Vec<TimelineEvent>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, subtask_id, event_type, message, metadata, created_at
                 FROM timeline_events WHERE subtask_id = ?1
                 ORDER BY created_at DESC, rowid DESC",
                params![subtask_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_timeline: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn count_pending(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM subtasks WHERE status = 'pending'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_pending: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_pending row: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_pending row: {e}"))),
        }
    }
}

/// SUBTASK_COLUMNS with each column prefixed `s.` for joined queries.
fn qualified_subtask_columns() -> String {
    SUBTASK_COLUMNS
        .split(", ")
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}
