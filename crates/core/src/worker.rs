//! Fixed-size pool of long-lived executors draining the job queue.
//!
//! Per task: mark running, then for each target in ascending order pick the
//! nearest anchors, interpolate with no store lock held, and replace the
//! frame. A single frame failing is recorded and the task moves on.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::frame_store::{FrameStore, FrameStoreError, ReplaceOutcome, StoreResult};
use crate::interpolator::{InterpolationInput, InterpolatorPool};
use crate::queue::{JobQueue, RetryPolicy, TaskDescriptor};
use crate::repos::RepoRegistry;
use crate::task::{FrameFailure, TaskRecord, TaskRegistry};

/// Shared handles every worker needs.
pub struct WorkerContext {
    pub repos: Arc<RepoRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub queue: Arc<JobQueue>,
    pub interpolators: InterpolatorPool,
    pub retry: RetryPolicy,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>, size: usize) -> Self {
        let size = size.max(1);
        let handles = (0..size)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(
                    worker_loop(ctx).instrument(tracing::info_span!("worker", worker_id)),
                )
            })
            .collect();

        info!(
            pool_size = size,
            model_instances = ctx.interpolators.instances(),
            interpolator = ctx.interpolators.name(),
            "Worker pool started"
        );
        Self {
            queue: Arc::clone(&ctx.queue),
            handles,
        }
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub async fn shutdown(self) {
        self.queue.close();
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker join failure");
            }
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>) {
    while let Some(descriptor) = ctx.queue.dequeue().await {
        let task_id = descriptor.task_id.clone();
        let task_ctx = Arc::clone(&ctx);
        // A panicking task must not take the executor down with it; its
        // record stays Running until the next startup redelivers it.
        let run = tokio::spawn(
            async move { execute_task(&task_ctx, descriptor).await }.in_current_span(),
        );
        if let Err(err) = run.await {
            error!(task_id = %task_id, error = %err, "Worker join failure");
        }
    }
    debug!("Job queue closed; worker exiting");
}

/// Runs one delivered task to a terminal state. Redelivered tasks resume:
/// frames already recorded as written are skipped.
pub async fn execute_task(ctx: &WorkerContext, descriptor: TaskDescriptor) -> Option<TaskRecord> {
    let task_id = descriptor.task_id.as_str();
    let Some(record) = ctx.tasks.get(task_id) else {
        warn!(task_id, "Delivered task has no record; dropping");
        return None;
    };
    if record.state.is_terminal() {
        debug!(task_id, state = ?record.state, "Skipping redelivered terminal task");
        return Some(record);
    }

    let record = ctx.tasks.update(task_id, |task| {
        if task.mark_running(Utc::now()) {
            info!(
                task_id = %task.id,
                repo_id = %task.repo_id,
                total = task.progress.total,
                "Task started"
            );
        } else {
            info!(task_id = %task.id, done = task.progress.done, "Task resumed after redelivery");
        }
    })?;

    let store = match ctx.repos.get(&record.repo_id) {
        Ok(Some(store)) => store,
        Ok(None) => {
            return finish(ctx, &record, fail_remaining(&record, "repo no longer exists"));
        }
        Err(err) => {
            return finish(
                ctx,
                &record,
                fail_remaining(&record, &format!("failed to open repo: {err}")),
            );
        }
    };

    // Targets not yet written are not valid anchors; failed targets stay out.
    let mut excluded: BTreeSet<u32> = record
        .target_frames
        .iter()
        .copied()
        .filter(|frame| !record.is_written(*frame))
        .collect();
    let mut failures = Vec::new();

    for &frame in &record.target_frames {
        if record.is_written(frame) {
            continue;
        }

        match process_frame(ctx, &store, &record, frame, &excluded).await {
            Ok(outcome) => {
                excluded.remove(&frame);
                ctx.tasks.update(task_id, |task| {
                    task.record_written(frame);
                    if let Some(previous) = overwritten_by_other(task, &outcome) {
                        warn!(
                            task_id = %task.id,
                            frame,
                            previous_task_id = %previous,
                            "Overwrote frame written by another task after submission"
                        );
                        task.record_overwrite(frame, &previous);
                    }
                });
            }
            Err(reason) => {
                warn!(task_id, frame, reason = %reason, "Frame interpolation failed");
                failures.push(FrameFailure { frame, reason });
            }
        }
    }

    finish(ctx, &record, failures)
}

async fn process_frame(
    ctx: &WorkerContext,
    store: &Arc<FrameStore>,
    record: &TaskRecord,
    frame: u32,
    excluded: &BTreeSet<u32>,
) -> Result<ReplaceOutcome, String> {
    let total = store.frame_count();
    if frame == 0 || frame > total {
        return Err(FrameStoreError::NotFound {
            number: frame,
            total,
        }
        .to_string());
    }

    let bytes = match nearest_anchors(frame, total, excluded) {
        (Some(before), Some(after)) => {
            let input = InterpolationInput {
                before: read_frame(store, before).await.map_err(|e| e.to_string())?,
                after: read_frame(store, after).await.map_err(|e| e.to_string())?,
                time: interpolation_time(frame, before, after),
                extension: store.frame_extension(frame).map_err(|e| e.to_string())?,
            };
            debug!(
                task_id = %record.id,
                frame,
                before,
                after,
                time = input.time,
                "Interpolating frame"
            );
            ctx.interpolators
                .interpolate(input)
                .await
                .map_err(|e| e.to_string())?
        }
        // Edge of the video: copy the only neighbor into place.
        (Some(neighbor), None) | (None, Some(neighbor)) => {
            debug!(task_id = %record.id, frame, neighbor, "Copying single anchor");
            read_frame(store, neighbor).await.map_err(|e| e.to_string())?
        }
        (None, None) => return Err("no anchor frames".to_string()),
    };

    let bytes = Arc::new(bytes);
    ctx.retry
        .run(
            "replace_frame",
            || {
                let store = Arc::clone(store);
                let bytes = Arc::clone(&bytes);
                let writer = record.id.clone();
                run_blocking(move || store.replace(frame, &bytes, Some(&writer)))
            },
            FrameStoreError::is_transient,
        )
        .await
        .map_err(|e| e.to_string())
}

fn finish(
    ctx: &WorkerContext,
    record: &TaskRecord,
    failures: Vec<FrameFailure>,
) -> Option<TaskRecord> {
    let finished = ctx.tasks.update(&record.id, |task| {
        task.finish(failures, Utc::now());
    })?;
    info!(
        task_id = %finished.id,
        repo_id = %finished.repo_id,
        state = ?finished.state,
        done = finished.progress.done,
        total = finished.progress.total,
        duration_ms = finished.duration_ms(),
        "Task finished"
    );
    Some(finished)
}

fn fail_remaining(record: &TaskRecord, reason: &str) -> Vec<FrameFailure> {
    record
        .target_frames
        .iter()
        .filter(|frame| !record.is_written(**frame))
        .map(|&frame| FrameFailure {
            frame,
            reason: reason.to_string(),
        })
        .collect()
}

/// The previous writer, when a different task wrote the replaced content
/// after `task` was submitted.
fn overwritten_by_other(task: &TaskRecord, outcome: &ReplaceOutcome) -> Option<String> {
    let previous = outcome.previous_writer.as_deref()?;
    (previous != task.id && outcome.previous_revision > task.base_version)
        .then(|| previous.to_string())
}

/// Greatest anchor below `frame` and least anchor above it, within `1..=total`.
pub fn nearest_anchors(
    frame: u32,
    total: u32,
    excluded: &BTreeSet<u32>,
) -> (Option<u32>, Option<u32>) {
    let before = (1..frame).rev().find(|n| !excluded.contains(n));
    let after = (frame.saturating_add(1)..=total).find(|n| !excluded.contains(n));
    (before, after)
}

pub fn interpolation_time(frame: u32, before: u32, after: u32) -> f32 {
    if after <= before {
        return 0.5;
    }
    (frame - before) as f32 / (after - before) as f32
}

async fn read_frame(store: &Arc<FrameStore>, number: u32) -> StoreResult<Vec<u8>> {
    let store = Arc::clone(store);
    run_blocking(move || store.read_frame(number)).await
}

async fn run_blocking<T, F>(op: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(|err| FrameStoreError::Io {
        context: "frame store operation did not complete".to_string(),
        source: std::io::Error::other(err.to_string()),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(frames: &[u32]) -> BTreeSet<u32> {
        frames.iter().copied().collect()
    }

    #[test]
    fn anchors_skip_pending_targets() {
        assert_eq!(nearest_anchors(5, 10, &set(&[5])), (Some(4), Some(6)));
        assert_eq!(nearest_anchors(4, 10, &set(&[4, 5, 6])), (Some(3), Some(7)));
        assert_eq!(nearest_anchors(1, 10, &set(&[1])), (None, Some(2)));
        assert_eq!(nearest_anchors(10, 10, &set(&[10])), (Some(9), None));
        assert_eq!(nearest_anchors(1, 1, &set(&[1])), (None, None));
        assert_eq!(nearest_anchors(2, 3, &set(&[1, 2, 3])), (None, None));
    }

    #[test]
    fn time_is_relative_position_between_anchors() {
        assert_eq!(interpolation_time(5, 4, 6), 0.5);
        assert_eq!(interpolation_time(4, 3, 7), 0.25);
        assert_eq!(interpolation_time(6, 3, 7), 0.75);
    }

    #[test]
    fn overwrite_detection_ignores_self_and_older_writes() {
        let mut task = TaskRecord::new("repo", &[3], 10);
        task.id = "me".to_string();
        let outcome = |writer: Option<&str>, previous_revision| ReplaceOutcome {
            frame: crate::frame_store::FrameRef {
                number: 3,
                path: "repo/frame_000003.png".to_string(),
                size: 1,
                revision: 20,
            },
            version: 20,
            previous_writer: writer.map(ToOwned::to_owned),
            previous_revision,
        };

        assert_eq!(
            overwritten_by_other(&task, &outcome(Some("other"), 12)),
            Some("other".to_string())
        );
        assert_eq!(overwritten_by_other(&task, &outcome(Some("other"), 8)), None);
        assert_eq!(overwritten_by_other(&task, &outcome(Some("me"), 12)), None);
        assert_eq!(overwritten_by_other(&task, &outcome(None, 12)), None);
    }

    /// Blocks the target frame's path with a directory, so renaming the new
    /// content into place fails, and clears it after `clear_after`.
    struct BlockingInterpolator {
        target: std::path::PathBuf,
        clear_after: Option<std::time::Duration>,
    }

    impl crate::interpolator::FrameInterpolator for BlockingInterpolator {
        fn name(&self) -> &str {
            "blocking"
        }

        fn interpolate(
            &self,
            _input: &InterpolationInput,
        ) -> Result<Vec<u8>, crate::interpolator::InterpolationError> {
            std::fs::remove_file(&self.target).expect("remove frame file");
            std::fs::create_dir_all(self.target.join("blocker")).expect("block frame path");
            if let Some(delay) = self.clear_after {
                let target = self.target.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    std::fs::remove_dir_all(&target).expect("clear blocker");
                });
            }
            Ok(b"repaired".to_vec())
        }
    }

    fn context_with(
        temp: &std::path::Path,
        clear_after: Option<std::time::Duration>,
        retry: RetryPolicy,
    ) -> (WorkerContext, Arc<FrameStore>) {
        let repos = Arc::new(RepoRegistry::new(temp.join("repos")));
        let store = repos.create("clip").expect("create repo");
        for n in 1..=5 {
            store
                .append("png", format!("f{n}").as_bytes())
                .expect("append");
        }
        let interpolator = BlockingInterpolator {
            target: store.frame_path(3).expect("frame path"),
            clear_after,
        };
        let ctx = WorkerContext {
            repos,
            tasks: Arc::new(TaskRegistry::in_memory()),
            queue: Arc::new(JobQueue::new()),
            interpolators: InterpolatorPool::new(Arc::new(interpolator), 1),
            retry,
        };
        (ctx, store)
    }

    fn descriptor(record: &TaskRecord) -> TaskDescriptor {
        TaskDescriptor {
            task_id: record.id.clone(),
            repo_id: record.repo_id.clone(),
            target_frames: record.target_frames.clone(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_write_failure_is_retried_and_counted_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backoff = std::time::Duration::from_millis(1_000);
        let (ctx, store) = context_with(
            temp.path(),
            Some(std::time::Duration::from_millis(250)),
            RetryPolicy {
                max_attempts: 4,
                initial_backoff: backoff,
                max_backoff: backoff,
            },
        );
        let record = TaskRecord::new("clip", &[3], store.version());
        ctx.tasks.insert(record.clone()).expect("insert");

        let started = std::time::Instant::now();
        let finished = execute_task(&ctx, descriptor(&record))
            .await
            .expect("task record");

        assert!(started.elapsed() >= std::time::Duration::from_millis(900));
        assert_eq!(finished.state, crate::task::TaskState::Completed);
        assert_eq!(finished.progress.done, 1);
        assert_eq!(finished.written_frames, vec![3]);
        assert_eq!(store.read_frame(3).expect("read"), b"repaired");
        // Five appends plus exactly one successful replace.
        assert_eq!(store.version(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn persistent_write_failure_fails_the_frame() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (ctx, store) = context_with(
            temp.path(),
            None,
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(1),
            },
        );
        let record = TaskRecord::new("clip", &[3], store.version());
        ctx.tasks.insert(record.clone()).expect("insert");

        let finished = execute_task(&ctx, descriptor(&record))
            .await
            .expect("task record");

        assert_eq!(finished.state, crate::task::TaskState::Failed);
        assert_eq!(finished.progress.done, 0);
        let error = finished.error.expect("error");
        assert_eq!(error.failed_frames[0].frame, 3);
        assert!(error.failed_frames[0].reason.contains("failed to write"));
        assert_eq!(store.version(), 5);
    }
}
