use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use framefix_core::config::AppConfig;
use framefix_core::interpolator::{FrameInterpolator, InterpolationError, InterpolationInput};
use framefix_core::server::AppState;
use framefix_core::status::ChangeCursor;
use framefix_core::task::{TaskRecord, TaskRegistry, TaskState};

/// Joins the anchor bytes; refuses any pair whose `before` anchor matches
/// `fail_on_before`.
struct ScriptedInterpolator {
    fail_on_before: Option<&'static [u8]>,
}

impl FrameInterpolator for ScriptedInterpolator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn interpolate(&self, input: &InterpolationInput) -> Result<Vec<u8>, InterpolationError> {
        if self.fail_on_before == Some(input.before.as_slice()) {
            return Err(InterpolationError::Command("model rejected input".to_string()));
        }
        let mut out = b"mid(".to_vec();
        out.extend_from_slice(&input.before);
        out.push(b'|');
        out.extend_from_slice(&input.after);
        out.push(b')');
        Ok(out)
    }
}

fn config(pool_size: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.workers.pool_size = pool_size;
    config.queue.initial_backoff_ms = 1;
    config
}

fn state_with_frames(
    dir: &Path,
    config: AppConfig,
    tasks: Arc<TaskRegistry>,
    frames: u32,
) -> AppState {
    let state = AppState::with_tasks(config, dir.to_path_buf(), tasks);
    let store = state.repos().create("clip").expect("create repo");
    for n in (store.frame_count() + 1)..=frames {
        store
            .append("png", format!("f{n}").as_bytes())
            .expect("append frame");
    }
    state
}

async fn wait_for_terminal(state: &AppState, task_id: &str) -> TaskRecord {
    for _ in 0..300 {
        if let Some(task) = state.tasks().get(task_id) {
            if task.state.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish");
}

#[tokio::test]
async fn replaces_targets_and_completes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 10);
    let store = state.repos().get("clip").unwrap().unwrap();
    let before = store.list_range(1, 10);

    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));
    let submitted = state.dispatcher().submit("clip", &[3, 7]).expect("submit");
    assert_eq!(submitted.state, TaskState::Queued);
    assert_eq!(submitted.progress.total, 2);

    let finished = wait_for_terminal(&state, &submitted.id).await;
    assert_eq!(finished.state, TaskState::Completed);
    assert_eq!(finished.progress.done, 2);
    assert!(finished.error.is_none());
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());

    assert_eq!(store.read_frame(3).unwrap(), b"mid(f2|f4)");
    assert_eq!(store.read_frame(7).unwrap(), b"mid(f6|f8)");
    let after = store.list_range(1, 10);
    assert!(after.version > before.version);
    assert!(after.frames[2].revision > before.frames[2].revision);
    assert!(after.frames[6].revision > before.frames[6].revision);
    assert_eq!(after.frames[4], before.frames[4]);

    workers.shutdown().await;
}

#[tokio::test]
async fn single_frame_failure_fails_task_but_keeps_other_writes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 10);
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator {
        fail_on_before: Some(b"f4"),
    }));

    let task = state.dispatcher().submit("clip", &[9, 5]).expect("submit");
    let finished = wait_for_terminal(&state, &task.id).await;

    assert_eq!(finished.state, TaskState::Failed);
    assert_eq!(finished.progress.done, 1);
    assert_eq!(finished.written_frames, vec![9]);
    let error = finished.error.expect("failed task carries an error");
    assert_eq!(error.failed_frames.len(), 1);
    assert_eq!(error.failed_frames[0].frame, 5);
    assert!(error.failed_frames[0].reason.contains("model rejected input"));
    assert!(error.message.contains('5'));

    let store = state.repos().get("clip").unwrap().unwrap();
    assert_eq!(store.read_frame(5).unwrap(), b"f5");
    assert_eq!(store.read_frame(9).unwrap(), b"mid(f8|f10)");

    workers.shutdown().await;
}

#[tokio::test]
async fn adjacent_targets_use_nearest_valid_anchors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 6);
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));

    let task = state.dispatcher().submit("clip", &[1, 3, 4, 6]).expect("submit");
    let finished = wait_for_terminal(&state, &task.id).await;
    assert_eq!(finished.state, TaskState::Completed);

    let store = state.repos().get("clip").unwrap().unwrap();
    // Edge frames copy their only neighbor.
    assert_eq!(store.read_frame(1).unwrap(), b"f2");
    assert_eq!(store.read_frame(3).unwrap(), b"mid(f2|f5)");
    // Frame 3 was written first, so it anchors frame 4.
    assert_eq!(store.read_frame(4).unwrap(), b"mid(mid(f2|f5)|f5)");
    assert_eq!(store.read_frame(6).unwrap(), b"f5");

    workers.shutdown().await;
}

#[tokio::test]
async fn every_frame_targeted_has_no_anchors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 2);
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));

    let task = state.dispatcher().submit("clip", &[1, 2]).expect("submit");
    let finished = wait_for_terminal(&state, &task.id).await;
    assert_eq!(finished.state, TaskState::Failed);
    assert_eq!(finished.progress.done, 0);
    let error = finished.error.expect("error");
    assert!(error
        .failed_frames
        .iter()
        .all(|failure| failure.reason == "no anchor frames"));

    workers.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_tasks_complete_independently() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(2), Arc::new(TaskRegistry::in_memory()), 20);
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));

    let first = state.dispatcher().submit("clip", &[2, 3, 4]).expect("submit");
    let second = state.dispatcher().submit("clip", &[15, 16]).expect("submit");

    let first = wait_for_terminal(&state, &first.id).await;
    let second = wait_for_terminal(&state, &second.id).await;
    assert_eq!(first.state, TaskState::Completed);
    assert_eq!(second.state, TaskState::Completed);
    assert_eq!(first.progress.done, 3);
    assert_eq!(second.progress.done, 2);
    assert!(first.overwrites.is_empty());
    assert!(second.overwrites.is_empty());

    let store = state.repos().get("clip").unwrap().unwrap();
    let listing = store.list_range(1, 20);
    assert_eq!(listing.total, 20);
    assert_eq!(listing.version, 25);

    workers.shutdown().await;
}

#[tokio::test]
async fn overlapping_task_records_whose_write_it_replaced() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 8);

    // Both submitted before any worker runs; FIFO order decides the writer.
    let earlier = state.dispatcher().submit("clip", &[4]).expect("submit");
    let later = state.dispatcher().submit("clip", &[4]).expect("submit");
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));

    let earlier = wait_for_terminal(&state, &earlier.id).await;
    let later = wait_for_terminal(&state, &later.id).await;

    assert_eq!(earlier.state, TaskState::Completed);
    assert_eq!(later.state, TaskState::Completed);
    assert!(earlier.overwrites.is_empty());
    assert_eq!(later.overwrites.len(), 1);
    assert_eq!(later.overwrites[0].frame, 4);
    assert_eq!(later.overwrites[0].task_id, earlier.id);

    workers.shutdown().await;
}

#[tokio::test]
async fn pollers_see_version_advance_after_replace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = state_with_frames(temp.path(), config(1), Arc::new(TaskRegistry::in_memory()), 5);
    let store = state.repos().get("clip").unwrap().unwrap();

    let mut early = ChangeCursor::new();
    let first_view = store.list_range(1, 5);
    assert!(early.observe(&first_view));

    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));
    let task = state.dispatcher().submit("clip", &[3]).expect("submit");
    wait_for_terminal(&state, &task.id).await;

    let mut late = ChangeCursor::new();
    let second_view = store.list_range(1, 5);
    assert!(late.observe(&second_view));
    assert!(early.observe(&second_view));
    assert!(second_view.version > first_view.version);
    assert_eq!(store.read_frame(3).unwrap(), b"mid(f2|f4)");
    assert!(!early.observe(&store.list_range(1, 5)));

    workers.shutdown().await;
}

#[tokio::test]
async fn restored_running_task_resumes_without_rewriting_done_frames() {
    let temp = tempfile::tempdir().expect("tempdir");

    let task_id = {
        let tasks = TaskRegistry::open(temp.path());
        let mut record = TaskRecord::new("clip", &[2, 6], 8);
        record.mark_running(Utc::now());
        record.record_written(2);
        let task_id = record.id.clone();
        tasks.insert(record).expect("insert");
        task_id
    };

    let tasks = Arc::new(TaskRegistry::open(temp.path()));
    let state = state_with_frames(temp.path(), config(1), tasks, 8);
    let workers = state.spawn_workers_with(Arc::new(ScriptedInterpolator { fail_on_before: None }));
    assert_eq!(state.requeue_on_startup(), 1);

    let finished = wait_for_terminal(&state, &task_id).await;
    assert_eq!(finished.state, TaskState::Completed);
    assert_eq!(finished.progress.done, 2);
    assert_eq!(finished.written_frames, vec![2, 6]);

    let store = state.repos().get("clip").unwrap().unwrap();
    assert_eq!(store.read_frame(2).unwrap(), b"f2");
    assert_eq!(store.read_frame(6).unwrap(), b"mid(f5|f7)");

    workers.shutdown().await;

    let reopened = TaskRegistry::open(temp.path());
    assert_eq!(reopened.get(&task_id).unwrap().state, TaskState::Completed);
}
