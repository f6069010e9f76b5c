//! Interpolation task records and the keyed collection that holds them.
//!
//! A record moves `Queued -> Running -> {Completed | Failed}` and never back.
//! Once terminal it is frozen: every mutator on [`TaskRecord`] is a no-op for
//! terminal records. Only the worker side mutates state and progress, through
//! [`TaskRegistry::update`].

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

mod persistence;

pub use persistence::TasksPersistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub done: u32,
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFailure {
    pub frame: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub message: String,
    pub failed_frames: Vec<FrameFailure>,
}

/// A frame whose content, written by another task after this one was
/// submitted, was replaced by this task's write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameOverwrite {
    pub frame: u32,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub repo_id: String,
    pub target_frames: Vec<u32>,
    pub state: TaskState,
    pub progress: TaskProgress,
    pub written_frames: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub overwrites: Vec<FrameOverwrite>,
    /// Frame store version observed when the task was submitted.
    pub base_version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// New `Queued` record; `target_frames` is deduplicated and sorted.
    pub fn new(repo_id: &str, target_frames: &[u32], base_version: u64) -> Self {
        let targets: Vec<u32> = target_frames
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            repo_id: repo_id.to_string(),
            progress: TaskProgress {
                done: 0,
                total: targets.len() as u32,
            },
            target_frames: targets,
            state: TaskState::Queued,
            written_frames: Vec::new(),
            error: None,
            overwrites: Vec::new(),
            base_version,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `Queued -> Running`. Returns `false` when the record was not queued
    /// (already running after a redelivery, or terminal).
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Queued {
            return false;
        }
        self.state = TaskState::Running;
        self.started_at = Some(now);
        true
    }

    /// Records a successful write; `done` counts distinct written targets.
    pub fn record_written(&mut self, frame: u32) -> bool {
        if self.state != TaskState::Running
            || !self.target_frames.contains(&frame)
            || self.written_frames.contains(&frame)
        {
            return false;
        }
        self.written_frames.push(frame);
        self.written_frames.sort_unstable();
        self.progress.done = self.written_frames.len() as u32;
        true
    }

    pub fn record_overwrite(&mut self, frame: u32, task_id: &str) {
        if self.state != TaskState::Running {
            return;
        }
        self.overwrites.push(FrameOverwrite {
            frame,
            task_id: task_id.to_string(),
        });
    }

    /// `Running -> Completed` when `failures` is empty, else `Running -> Failed`.
    pub fn finish(&mut self, failures: Vec<FrameFailure>, now: DateTime<Utc>) -> bool {
        if self.state != TaskState::Running {
            return false;
        }

        if failures.is_empty() {
            self.state = TaskState::Completed;
        } else {
            let frames = failures
                .iter()
                .map(|failure| failure.frame.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.state = TaskState::Failed;
            self.error = Some(TaskError {
                message: format!(
                    "{} of {} frames failed: {frames}",
                    failures.len(),
                    self.progress.total
                ),
                failed_frames: failures,
            });
        }
        self.completed_at = Some(now);
        true
    }

    pub fn is_written(&self, frame: u32) -> bool {
        self.written_frames.contains(&frame)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        let completed_at = self.completed_at?;
        let started_at = self.started_at.unwrap_or(self.created_at);
        Some((completed_at - started_at).num_milliseconds().max(0))
    }
}

/// Keyed collection of task records with write-through persistence.
pub struct TaskRegistry {
    tasks: DashMap<String, TaskRecord>,
    persistence: Option<TasksPersistence>,
}

impl TaskRegistry {
    pub fn in_memory() -> Self {
        Self {
            tasks: DashMap::new(),
            persistence: None,
        }
    }

    /// Opens `tasks.db` under `data_dir` and restores every persisted record.
    /// Persistence failures degrade to an in-memory registry.
    pub fn open(data_dir: &Path) -> Self {
        let persistence = match TasksPersistence::new(data_dir) {
            Ok(persistence) => persistence,
            Err(err) => {
                warn!(
                    error = %err,
                    data_dir = %data_dir.display(),
                    "Failed to initialize task persistence; running with in-memory task state only"
                );
                return Self::in_memory();
            }
        };

        let tasks = DashMap::new();
        match persistence.load_tasks() {
            Ok(restored) => {
                let restored_count = restored.len();
                for task in restored {
                    tasks.insert(task.id.clone(), task);
                }
                info!(
                    restored_count,
                    db_path = %persistence.db_path().display(),
                    "Restored persisted tasks"
                );
            }
            Err(err) => {
                warn!(
                    error = %err,
                    db_path = %persistence.db_path().display(),
                    "Failed to restore persisted tasks; continuing with empty task state"
                );
            }
        }

        Self {
            tasks,
            persistence: Some(persistence),
        }
    }

    /// Persists then publishes a new record.
    pub fn insert(&self, record: TaskRecord) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.upsert_task(&record)?;
        }
        self.tasks.insert(record.id.clone(), record);
        Ok(())
    }

    /// Unpublishes a record and deletes its persisted row.
    pub fn remove(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let removed = self.tasks.remove(task_id).map(|(_, task)| task);
        if let Some(persistence) = &self.persistence {
            persistence.delete_task(task_id)?;
        }
        Ok(removed)
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|task| task.clone())
    }

    /// Retained records, newest first, optionally restricted to one repo.
    pub fn list(&self, repo_id: Option<&str>) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|task| repo_id.map_or(true, |repo| task.repo_id == repo))
            .map(|task| task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Applies `mutate` to the record and persists the resulting snapshot.
    /// The map entry is released before touching the database.
    pub(crate) fn update<F>(&self, task_id: &str, mutate: F) -> Option<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let snapshot = {
            let mut task = self.tasks.get_mut(task_id)?;
            mutate(&mut task);
            task.clone()
        };

        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.upsert_task(&snapshot) {
                error!(task_id, error = ?err, "Failed to persist task snapshot");
            }
        }
        Some(snapshot)
    }

    /// Records that were queued or running when last persisted.
    pub fn pending(&self) -> Vec<TaskRecord> {
        let mut pending: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|task| !task.state.is_terminal())
            .map(|task| task.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending
    }

    /// Drops terminal records completed more than `retention` ago.
    pub fn purge_expired(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = now - retention;

        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|task| {
                task.state.is_terminal()
                    && task.completed_at.is_some_and(|completed| completed < cutoff)
            })
            .map(|task| task.id.clone())
            .collect();

        for task_id in &expired {
            self.tasks.remove(task_id);
            if let Some(persistence) = &self.persistence {
                if let Err(err) = persistence.delete_task(task_id) {
                    warn!(task_id = %task_id, error = %err, "Failed to delete expired task row");
                }
            }
        }
        expired.len()
    }
}
