//! Task metadata — the read-only collaborator owning subtasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task groups the subtasks produced for one inference/training job.
///
/// The engine only reads task metadata (eligibility matching and DTO
/// assembly); subtask state lives on the subtasks themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Workload kind used for provider eligibility (e.g. "inference").
    pub task_type: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serde_roundtrip() {
        let task = Task::new("finetune-7b", "training", Utc::now());
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.task_type, "training");
    }
}
