//! Video ingestion: read metadata with ffprobe, extract frames with ffmpeg
//! into a scratch directory, then append them to the store in order.

use std::fs;
use std::io::{BufRead, Cursor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::frame_store::{FrameStore, IngestClaim};

const EXTRACTED_EXTENSION: &str = "jpg";
const EXTRACTED_PATTERN: &str = "frame_%06d.jpg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub repo_id: String,
    pub frames: u32,
    pub version: u64,
    pub elapsed_ms: u64,
}

/// Extracts `video` into the claimed store. Blocking; callers on the async
/// runtime should use `spawn_blocking`.
pub fn ingest_video(
    video: &Path,
    claim: &IngestClaim,
    scratch_root: &Path,
) -> Result<IngestSummary> {
    let started = Instant::now();
    let store = claim.store();
    if !video.is_file() {
        bail!("video not found: {}", video.display());
    }

    let report = run_ffprobe(video)?;
    let info = serde_json::to_vec_pretty(&video_info_from_ffprobe(&report))
        .context("failed to encode video info")?;
    store
        .write_video_info(&info)
        .context("failed to write video info")?;

    let staging = scratch_root.join(format!("framefix-extract-{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create staging dir: {}", staging.display()))?;
    let result =
        extract_frames(video, &staging).and_then(|()| append_staged_frames(&staging, store));
    let _ = fs::remove_dir_all(&staging);
    let frames = result?;

    store
        .mark_processing_complete()
        .context("failed to mark processing complete")?;

    let summary = IngestSummary {
        repo_id: store.repo_id().to_string(),
        frames,
        version: store.version(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        repo_id = %summary.repo_id,
        frames = summary.frames,
        version = summary.version,
        elapsed_ms = summary.elapsed_ms,
        "Ingestion finished"
    );
    Ok(summary)
}

pub fn run_ffprobe(path: &Path) -> Result<Value> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe; is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON output")
}

/// Keeps the first video stream, the first audio stream and the container
/// section of an ffprobe document.
pub fn video_info_from_ffprobe(report: &Value) -> Value {
    let first_stream = |codec_type: &str| {
        report["streams"]
            .as_array()
            .and_then(|streams| {
                streams
                    .iter()
                    .find(|stream| stream["codec_type"].as_str() == Some(codec_type))
            })
            .cloned()
            .unwrap_or_else(|| json!({}))
    };

    json!({
        "video": first_stream("video"),
        "audio": first_stream("audio"),
        "format": report.get("format").cloned().unwrap_or_else(|| json!({})),
    })
}

fn extract_frames(video: &Path, staging: &Path) -> Result<()> {
    let output = crate::runtime::command_for("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-v", "error", "-i"])
        .arg(video)
        .args(["-q:v", "1", "-y"])
        .arg(staging.join(EXTRACTED_PATTERN))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffmpeg; is FFmpeg installed?")?;

    for line in Cursor::new(&output.stderr).lines().map_while(Result::ok) {
        debug!(target: "ffmpeg_stderr", "{}", line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffmpeg exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}

/// Appends every extracted frame in `staging`, ordered by file name.
fn append_staged_frames(staging: &Path, store: &FrameStore) -> Result<u32> {
    let mut staged: Vec<PathBuf> = fs::read_dir(staging)
        .with_context(|| format!("failed to read staging dir: {}", staging.display()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(EXTRACTED_EXTENSION))
        })
        .collect();
    staged.sort();

    if staged.is_empty() {
        bail!("ffmpeg produced no frames");
    }

    for path in &staged {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        store
            .append(EXTRACTED_EXTENSION, &bytes)
            .with_context(|| format!("failed to append {}", path.display()))?;
    }
    Ok(staged.len() as u32)
}
