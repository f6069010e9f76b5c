//! On-disk frame store for a single repo.
//!
//! Frames live as `frame_NNNNNN.<ext>` files inside the repo directory, next to a
//! `store.json` metadata record holding the mutation `version`, the extraction
//! complete flag and per-frame revisions. The in-memory index is the read path:
//! listings are answered from one read-locked snapshot, so `frames`, `total`
//! and `version` always describe the same instant.
//!
//! Writes go to a temp file in the same directory and are renamed into place,
//! then the index is updated under a short write lock. Writers of the same frame
//! number are serialized by a per-frame mutex; writers of different frames never
//! wait on each other except for that index update.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const METADATA_FILE_NAME: &str = "store.json";
pub const VIDEO_INFO_FILE_NAME: &str = "video_info.json";
pub const SUPPORTED_FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

const FRAME_FILE_PREFIX: &str = "frame_";
const MAX_REPO_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum FrameStoreError {
    #[error("frame {number} not found (store has {total} frames)")]
    NotFound { number: u32, total: u32 },

    #[error("invalid repo id: {0:?}")]
    InvalidRepoId(String),

    #[error("unsupported frame extension: {0:?}")]
    UnsupportedExtension(String),

    #[error("corrupt frame store at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FrameStoreError {
    /// I/O failures may succeed on retry; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, FrameStoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub number: u32,
    /// Path relative to the repos root: `<repo_id>/<file name>`.
    pub path: String,
    pub size: u64,
    /// Store version at which this frame's content was last written.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameListing {
    pub frames: Vec<FrameRef>,
    pub total: u32,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub processing_complete: bool,
    pub frame_count: u32,
    pub has_metadata: bool,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub frame: FrameRef,
    pub version: u64,
    /// Task that wrote the content this replace overwrote, if any.
    pub previous_writer: Option<String>,
    pub previous_revision: u64,
}

#[derive(Debug, Clone)]
struct FrameEntry {
    file_name: String,
    size: u64,
    revision: u64,
    last_writer: Option<String>,
}

#[derive(Debug, Default)]
struct StoreIndex {
    frames: Vec<FrameEntry>,
    version: u64,
    processing_complete: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreMetadata {
    version: u64,
    processing_complete: bool,
    #[serde(default)]
    frames: Vec<PersistedFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedFrame {
    revision: u64,
    #[serde(default)]
    last_writer: Option<String>,
}

pub struct FrameStore {
    repo_id: String,
    dir: PathBuf,
    index: RwLock<StoreIndex>,
    frame_locks: DashMap<u32, Arc<Mutex<()>>>,
    append_lock: Mutex<()>,
    metadata_lock: Mutex<()>,
    ingest_claimed: AtomicBool,
}

/// Exclusive right to run the one-time extraction into a store.
/// Released when dropped.
#[derive(Debug)]
pub struct IngestClaim {
    store: Arc<FrameStore>,
}

impl IngestClaim {
    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }
}

impl Drop for IngestClaim {
    fn drop(&mut self) {
        self.store.ingest_claimed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("repo_id", &self.repo_id)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl FrameStore {
    /// Creates an empty store directory for `repo_id` under `root`.
    /// Opening an existing store is not an error; its state is loaded instead.
    pub fn create(root: &Path, repo_id: &str) -> StoreResult<Self> {
        validate_repo_id(repo_id)?;
        let dir = root.join(repo_id);
        fs::create_dir_all(&dir).map_err(|e| {
            FrameStoreError::io(format!("failed to create repo dir {}", dir.display()), e)
        })?;

        if dir.join(METADATA_FILE_NAME).exists() {
            return Self::open(root, repo_id);
        }

        let store = Self::from_index(repo_id, dir, StoreIndex::default());
        store.persist_metadata()?;
        info!(repo_id, "Created frame store");
        Ok(store)
    }

    /// Loads an existing store, rebuilding the index from the frame files on
    /// disk and the revisions recorded in `store.json`.
    pub fn open(root: &Path, repo_id: &str) -> StoreResult<Self> {
        validate_repo_id(repo_id)?;
        let dir = root.join(repo_id);
        if !dir.is_dir() {
            return Err(FrameStoreError::io(
                format!("repo dir not found: {}", dir.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let metadata = read_metadata(&dir)?;
        let files = scan_frame_files(&dir)?;

        let mut frames = Vec::with_capacity(files.len());
        for (position, (file_name, size)) in files.into_iter().enumerate() {
            let persisted = metadata.frames.get(position);
            frames.push(FrameEntry {
                file_name,
                size,
                revision: persisted.map_or(metadata.version, |p| p.revision),
                last_writer: persisted.and_then(|p| p.last_writer.clone()),
            });
        }

        let frame_count = frames.len();
        let index = StoreIndex {
            frames,
            version: metadata.version,
            processing_complete: metadata.processing_complete,
        };
        info!(
            repo_id,
            frame_count,
            version = index.version,
            "Opened frame store"
        );
        Ok(Self::from_index(repo_id, dir, index))
    }

    fn from_index(repo_id: &str, dir: PathBuf, index: StoreIndex) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            dir,
            index: RwLock::new(index),
            frame_locks: DashMap::new(),
            append_lock: Mutex::new(()),
            metadata_lock: Mutex::new(()),
            ingest_claimed: AtomicBool::new(false),
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version(&self) -> u64 {
        self.read_index().version
    }

    pub fn frame_count(&self) -> u32 {
        self.read_index().frames.len() as u32
    }

    /// Adds the next sequential frame. Used only while extracting.
    pub fn append(&self, extension: &str, bytes: &[u8]) -> StoreResult<FrameRef> {
        let extension = normalize_extension(extension)?;
        let _append_guard = lock_ignoring_poison(&self.append_lock);

        let number = self.frame_count() + 1;
        let file_name = frame_file_name(number, &extension);
        self.write_atomically(&file_name, bytes)?;

        let frame = {
            let mut index = self.write_index();
            index.version += 1;
            let entry = FrameEntry {
                file_name,
                size: bytes.len() as u64,
                revision: index.version,
                last_writer: None,
            };
            let frame = self.frame_ref(number, &entry);
            index.frames.push(entry);
            frame
        };

        self.persist_metadata()?;
        debug!(repo_id = %self.repo_id, frame = number, "Appended frame");
        Ok(frame)
    }

    /// Overwrites the content addressed by `number` in place.
    ///
    /// `writer` is the task id performing the write; it is remembered so a later
    /// writer can tell whose content it replaced.
    pub fn replace(
        &self,
        number: u32,
        bytes: &[u8],
        writer: Option<&str>,
    ) -> StoreResult<ReplaceOutcome> {
        let file_name = self.entry(number)?.file_name;

        let frame_lock = self.frame_lock(number);
        let _frame_guard = lock_ignoring_poison(&frame_lock);

        self.write_atomically(&file_name, bytes)?;

        let outcome = {
            let mut index = self.write_index();
            index.version += 1;
            let version = index.version;
            let entry = &mut index.frames[(number - 1) as usize];
            let previous_revision = entry.revision;
            let previous_writer = entry.last_writer.take();
            entry.size = bytes.len() as u64;
            entry.revision = version;
            entry.last_writer = writer.map(ToOwned::to_owned);
            let entry = entry.clone();

            ReplaceOutcome {
                frame: self.frame_ref(number, &entry),
                version,
                previous_writer,
                previous_revision,
            }
        };

        self.persist_metadata()?;
        debug!(
            repo_id = %self.repo_id,
            frame = number,
            version = outcome.version,
            "Replaced frame"
        );
        Ok(outcome)
    }

    /// Returns the closed range `[start, end]` clipped to the current bounds,
    /// with the total and version of the same snapshot.
    pub fn list_range(&self, start: u32, end: u32) -> FrameListing {
        let index = self.read_index();
        let total = index.frames.len() as u32;
        let start = start.max(1);
        let end = end.min(total);

        let frames = if start > end {
            Vec::new()
        } else {
            (start..=end)
                .map(|number| self.frame_ref(number, &index.frames[(number - 1) as usize]))
                .collect()
        };

        FrameListing {
            frames,
            total,
            version: index.version,
        }
    }

    pub fn frame(&self, number: u32) -> StoreResult<FrameRef> {
        let entry = self.entry(number)?;
        Ok(self.frame_ref(number, &entry))
    }

    pub fn frame_path(&self, number: u32) -> StoreResult<PathBuf> {
        Ok(self.dir.join(self.entry(number)?.file_name))
    }

    /// Reads the current bytes of a frame. Renames are atomic, so a reader sees
    /// either the old or the new content, never a mix.
    pub fn read_frame(&self, number: u32) -> StoreResult<Vec<u8>> {
        let path = self.frame_path(number)?;
        fs::read(&path)
            .map_err(|e| FrameStoreError::io(format!("failed to read {}", path.display()), e))
    }

    pub fn frame_extension(&self, number: u32) -> StoreResult<String> {
        let file_name = self.entry(number)?.file_name;
        Ok(file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default())
    }

    /// Claims the extraction for this store. `None` while another ingestion
    /// holds the claim, or once the store has frames or finished extracting.
    pub fn claim_ingestion(self: &Arc<Self>) -> Option<IngestClaim> {
        self.ingest_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let claim = IngestClaim {
            store: Arc::clone(self),
        };

        let populated = {
            let index = self.read_index();
            !index.frames.is_empty() || index.processing_complete
        };
        (!populated).then_some(claim)
    }

    /// Writes the ffprobe video description; its presence sets `has_metadata`.
    pub fn write_video_info(&self, bytes: &[u8]) -> StoreResult<()> {
        self.write_atomically(VIDEO_INFO_FILE_NAME, bytes)
    }

    pub fn mark_processing_complete(&self) -> StoreResult<()> {
        self.write_index().processing_complete = true;
        self.persist_metadata()
    }

    pub fn status(&self) -> StoreStatus {
        let index = self.read_index();
        StoreStatus {
            processing_complete: index.processing_complete,
            frame_count: index.frames.len() as u32,
            has_metadata: self.dir.join(VIDEO_INFO_FILE_NAME).is_file(),
            version: index.version,
        }
    }

    fn entry(&self, number: u32) -> StoreResult<FrameEntry> {
        let index = self.read_index();
        let total = index.frames.len() as u32;
        if number == 0 || number > total {
            return Err(FrameStoreError::NotFound { number, total });
        }
        Ok(index.frames[(number - 1) as usize].clone())
    }

    fn frame_ref(&self, number: u32, entry: &FrameEntry) -> FrameRef {
        FrameRef {
            number,
            path: format!("{}/{}", self.repo_id, entry.file_name),
            size: entry.size,
            revision: entry.revision,
        }
    }

    fn frame_lock(&self, number: u32) -> Arc<Mutex<()>> {
        self.frame_locks
            .entry(number)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_atomically(&self, file_name: &str, bytes: &[u8]) -> StoreResult<()> {
        write_file_atomically(&self.dir, file_name, bytes)
    }

    /// Serialized so the file on disk always reflects the newest snapshot:
    /// the snapshot is taken after the metadata lock is held.
    fn persist_metadata(&self) -> StoreResult<()> {
        let _metadata_guard = lock_ignoring_poison(&self.metadata_lock);
        let metadata = {
            let index = self.read_index();
            StoreMetadata {
                version: index.version,
                processing_complete: index.processing_complete,
                frames: index
                    .frames
                    .iter()
                    .map(|entry| PersistedFrame {
                        revision: entry.revision,
                        last_writer: entry.last_writer.clone(),
                    })
                    .collect(),
            }
        };

        let encoded = serde_json::to_vec_pretty(&metadata).map_err(|e| {
            FrameStoreError::io(
                "failed to encode store metadata",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        write_file_atomically(&self.dir, METADATA_FILE_NAME, &encoded)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, StoreIndex> {
        match self.index.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, StoreIndex> {
        match self.index.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Repo ids become directory names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_repo_id(repo_id: &str) -> StoreResult<()> {
    let valid = !repo_id.is_empty()
        && repo_id.len() <= MAX_REPO_ID_LEN
        && repo_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(FrameStoreError::InvalidRepoId(repo_id.to_string()))
    }
}

pub fn frame_file_name(number: u32, extension: &str) -> String {
    format!("{FRAME_FILE_PREFIX}{number:06}.{extension}")
}

fn normalize_extension(extension: &str) -> StoreResult<String> {
    let normalized = extension.trim_start_matches('.').to_ascii_lowercase();
    if SUPPORTED_FRAME_EXTENSIONS.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(FrameStoreError::UnsupportedExtension(extension.to_string()))
    }
}

fn parse_frame_file_name(file_name: &str) -> Option<u32> {
    let stem_and_ext = file_name.strip_prefix(FRAME_FILE_PREFIX)?;
    let (stem, ext) = stem_and_ext.rsplit_once('.')?;
    if !SUPPORTED_FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return None;
    }
    if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Returns `(file_name, size)` for every frame file, ordered by frame number.
/// The numbers must be exactly `1..=n`.
fn scan_frame_files(dir: &Path) -> StoreResult<Vec<(String, u64)>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| FrameStoreError::io(format!("failed to read {}", dir.display()), e))?;

    let mut numbered = Vec::new();
    let mut seen = HashSet::new();
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(number) = parse_frame_file_name(&file_name) else {
            continue;
        };
        if !seen.insert(number) {
            return Err(FrameStoreError::Corrupt {
                path: dir.to_path_buf(),
                reason: format!("frame {number} appears more than once"),
            });
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or_else(|err| {
            warn!(file = %file_name, error = %err, "Failed to stat frame file");
            0
        });
        numbered.push((number, file_name, size));
    }

    numbered.sort_by_key(|(number, _, _)| *number);
    for (position, (number, _, _)) in numbered.iter().enumerate() {
        let expected = position as u32 + 1;
        if *number != expected {
            return Err(FrameStoreError::Corrupt {
                path: dir.to_path_buf(),
                reason: format!("expected frame {expected}, found frame {number}"),
            });
        }
    }

    Ok(numbered
        .into_iter()
        .map(|(_, file_name, size)| (file_name, size))
        .collect())
}

fn read_metadata(dir: &Path) -> StoreResult<StoreMetadata> {
    let path = dir.join(METADATA_FILE_NAME);
    if !path.exists() {
        return Ok(StoreMetadata::default());
    }
    let raw = fs::read(&path)
        .map_err(|e| FrameStoreError::io(format!("failed to read {}", path.display()), e))?;
    serde_json::from_slice(&raw).map_err(|e| FrameStoreError::Corrupt {
        path,
        reason: format!("invalid metadata: {e}"),
    })
}

fn write_file_atomically(dir: &Path, file_name: &str, bytes: &[u8]) -> StoreResult<()> {
    let final_path = dir.join(file_name);
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, &final_path)
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(FrameStoreError::io(
            format!("failed to write {}", final_path.display()),
            err,
        ));
    }
    Ok(())
}

fn lock_ignoring_poison(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
