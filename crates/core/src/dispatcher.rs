use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::frame_store::FrameStoreError;
use crate::queue::{JobQueue, QueueClosed, TaskDescriptor};
use crate::repos::RepoRegistry;
use crate::task::{TaskRecord, TaskRegistry};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no target frames were given")]
    EmptyRequest,

    #[error("frames {invalid:?} are outside 1..={total}")]
    InvalidFrameRange { invalid: Vec<u32>, total: u32 },

    #[error("unknown repo: {0}")]
    UnknownRepo(String),

    #[error("failed to record task: {0:#}")]
    Persistence(anyhow::Error),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyRequest => "EMPTY_REQUEST",
            Self::InvalidFrameRange { .. } => "INVALID_FRAME_RANGE",
            Self::UnknownRepo(_) => "UNKNOWN_REPO",
            Self::Persistence(_) => "PERSISTENCE_FAILURE",
            Self::QueueClosed(_) => "QUEUE_CLOSED",
        }
    }
}

/// Accepts interpolation requests, validates them against the frame store
/// and hands them to the job queue.
#[derive(Clone)]
pub struct Dispatcher {
    repos: Arc<RepoRegistry>,
    tasks: Arc<TaskRegistry>,
    queue: Arc<JobQueue>,
}

impl Dispatcher {
    pub fn new(repos: Arc<RepoRegistry>, tasks: Arc<TaskRegistry>, queue: Arc<JobQueue>) -> Self {
        Self {
            repos,
            tasks,
            queue,
        }
    }

    pub fn submit(
        &self,
        repo_id: &str,
        target_frames: &[u32],
    ) -> Result<TaskRecord, DispatchError> {
        if target_frames.is_empty() {
            return Err(DispatchError::EmptyRequest);
        }

        let store = match self.repos.get(repo_id) {
            Ok(Some(store)) => store,
            Ok(None) | Err(FrameStoreError::InvalidRepoId(_)) => {
                return Err(DispatchError::UnknownRepo(repo_id.to_string()));
            }
            Err(err) => return Err(DispatchError::Persistence(err.into())),
        };

        // Empty range: total and version from one snapshot.
        let snapshot = store.list_range(1, 0);
        let mut invalid: Vec<u32> = target_frames
            .iter()
            .copied()
            .filter(|&n| n == 0 || n > snapshot.total)
            .collect();
        if !invalid.is_empty() {
            invalid.sort_unstable();
            invalid.dedup();
            return Err(DispatchError::InvalidFrameRange {
                invalid,
                total: snapshot.total,
            });
        }

        if self.queue.is_closed() {
            return Err(DispatchError::QueueClosed(QueueClosed));
        }

        let record = TaskRecord::new(repo_id, target_frames, snapshot.version);
        self.record_and_enqueue(&record)?;

        info!(
            task_id = %record.id,
            repo_id,
            total = record.progress.total,
            base_version = record.base_version,
            "Task created"
        );
        Ok(record)
    }

    /// The queue may close after the open check; a record whose descriptor
    /// was refused is withdrawn so it is never redelivered.
    fn record_and_enqueue(&self, record: &TaskRecord) -> Result<(), DispatchError> {
        self.tasks
            .insert(record.clone())
            .map_err(DispatchError::Persistence)?;

        if let Err(closed) = self.queue.enqueue(descriptor_for(record)) {
            if let Err(err) = self.tasks.remove(&record.id) {
                warn!(
                    task_id = %record.id,
                    error = %format!("{err:#}"),
                    "Failed to withdraw task refused by a closed queue"
                );
            }
            return Err(closed.into());
        }
        Ok(())
    }

    /// Re-enqueues every restored `Queued`/`Running` record.
    pub fn redeliver_pending(&self) -> usize {
        let mut redelivered = 0;
        for record in self.tasks.pending() {
            match self.queue.enqueue(descriptor_for(&record)) {
                Ok(()) => redelivered += 1,
                Err(err) => {
                    warn!(task_id = %record.id, error = %err, "Failed to redeliver task");
                    break;
                }
            }
        }
        if redelivered > 0 {
            info!(redelivered, "Redelivered unfinished tasks");
        }
        redelivered
    }
}

fn descriptor_for(record: &TaskRecord) -> TaskDescriptor {
    TaskDescriptor {
        task_id: record.id.clone(),
        repo_id: record.repo_id.clone(),
        target_frames: record.target_frames.clone(),
    }
}
