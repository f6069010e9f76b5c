use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::warn;

use super::{FrameOverwrite, TaskError, TaskProgress, TaskRecord, TaskState};

const STATE_QUEUED: &str = "queued";
const STATE_RUNNING: &str = "running";
const STATE_COMPLETED: &str = "completed";
const STATE_FAILED: &str = "failed";

const DB_FILE_NAME: &str = "tasks.db";

/// Write-through store for task records in `<data_dir>/tasks.db`.
#[derive(Debug, Clone)]
pub struct TasksPersistence {
    db_path: PathBuf,
}

impl TasksPersistence {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for tasks db: {}",
                data_dir.display()
            )
        })?;

        let persistence = Self {
            db_path: data_dir.join(DB_FILE_NAME),
        };
        persistence.initialize_schema()?;
        Ok(persistence)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        let target_frames_json =
            serde_json::to_string(&task.target_frames).context("failed to serialize targets")?;
        let written_frames_json = serde_json::to_string(&task.written_frames)
            .context("failed to serialize written frames")?;
        let overwrites_json =
            serde_json::to_string(&task.overwrites).context("failed to serialize overwrites")?;
        let error_json = task
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize task error")?;
        let updated_at = Utc::now().to_rfc3339();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO tasks (
                    id,
                    repo_id,
                    state,
                    target_frames_json,
                    done,
                    total,
                    written_frames_json,
                    error_json,
                    overwrites_json,
                    base_version,
                    created_at,
                    started_at,
                    completed_at,
                    updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    done = excluded.done,
                    written_frames_json = excluded.written_frames_json,
                    error_json = excluded.error_json,
                    overwrites_json = excluded.overwrites_json,
                    started_at = excluded.started_at,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at",
                params![
                    task.id,
                    task.repo_id,
                    state_to_str(task.state),
                    target_frames_json,
                    task.progress.done,
                    task.progress.total,
                    written_frames_json,
                    error_json,
                    overwrites_json,
                    task.base_version as i64,
                    task.created_at.to_rfc3339(),
                    task.started_at.map(|ts| ts.to_rfc3339()),
                    task.completed_at.map(|ts| ts.to_rfc3339()),
                    updated_at,
                ],
            )
            .with_context(|| format!("failed to upsert persisted task {}", task.id))?;
            Ok(())
        })
    }

    /// Loads every row; rows that fail to decode are skipped with a warning.
    pub fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT
                    id,
                    repo_id,
                    state,
                    target_frames_json,
                    done,
                    total,
                    written_frames_json,
                    error_json,
                    overwrites_json,
                    base_version,
                    created_at,
                    started_at,
                    completed_at
                 FROM tasks
                 ORDER BY created_at ASC, id ASC",
            )?;

            let rows = stmt.query_map([], |row| Ok(decode_row(row)))?;

            let mut tasks = Vec::new();
            for row in rows {
                match row {
                    Ok(Ok(task)) => tasks.push(task),
                    Ok(Err(err)) => {
                        warn!(error = %err, "Skipping undecodable persisted task row");
                    }
                    Err(err) => {
                        warn!(error = %err, "Skipping invalid persisted task row");
                    }
                }
            }
            Ok(tasks)
        })
    }

    pub fn delete_task(&self, task_id: &str) -> Result<usize> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])
                .with_context(|| format!("failed to delete persisted task {task_id}"))
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    repo_id TEXT NOT NULL,
                    state TEXT NOT NULL,
                    target_frames_json TEXT NOT NULL,
                    done INTEGER NOT NULL,
                    total INTEGER NOT NULL,
                    written_frames_json TEXT NOT NULL,
                    error_json TEXT,
                    overwrites_json TEXT NOT NULL,
                    base_version INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_tasks_repo ON tasks(repo_id);
                 CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize tasks persistence schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open tasks db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set tasks db busy timeout")?;
        op(&conn)
    }
}

fn decode_row(row: &Row<'_>) -> Result<TaskRecord> {
    let id: String = row.get(0)?;
    let state_raw: String = row.get(2)?;
    let state = parse_state(&state_raw)
        .with_context(|| format!("unknown persisted state for task {id}: {state_raw}"))?;

    let target_frames: Vec<u32> = serde_json::from_str(&row.get::<_, String>(3)?)
        .with_context(|| format!("invalid target frames for task {id}"))?;
    let written_frames: Vec<u32> = serde_json::from_str(&row.get::<_, String>(6)?)
        .with_context(|| format!("invalid written frames for task {id}"))?;
    let error: Option<TaskError> = row
        .get::<_, Option<String>>(7)?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .with_context(|| format!("invalid error snapshot for task {id}"))?;
    let overwrites: Vec<FrameOverwrite> = serde_json::from_str(&row.get::<_, String>(8)?)
        .with_context(|| format!("invalid overwrites for task {id}"))?;

    Ok(TaskRecord {
        repo_id: row.get(1)?,
        state,
        target_frames,
        progress: TaskProgress {
            done: row.get(4)?,
            total: row.get(5)?,
        },
        written_frames,
        error,
        overwrites,
        base_version: row.get::<_, i64>(9)?.max(0) as u64,
        created_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        started_at: parse_optional_timestamp(row.get(11)?)?,
        completed_at: parse_optional_timestamp(row.get(12)?)?,
        id,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn state_to_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Queued => STATE_QUEUED,
        TaskState::Running => STATE_RUNNING,
        TaskState::Completed => STATE_COMPLETED,
        TaskState::Failed => STATE_FAILED,
    }
}

fn parse_state(value: &str) -> Option<TaskState> {
    match value {
        STATE_QUEUED => Some(TaskState::Queued),
        STATE_RUNNING => Some(TaskState::Running),
        STATE_COMPLETED => Some(TaskState::Completed),
        STATE_FAILED => Some(TaskState::Failed),
        _ => None,
    }
}
