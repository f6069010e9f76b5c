use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::frame_store::{validate_repo_id, FrameStore, StoreResult};

/// Process-wide handle to every opened frame store, keyed by repo id.
///
/// Stores are opened lazily from `root` on first access and kept for the life of
/// the process; a repo's store is never dropped while its id is retained.
#[derive(Debug)]
pub struct RepoRegistry {
    root: PathBuf,
    stores: DashMap<String, Arc<FrameStore>>,
}

impl RepoRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            stores: DashMap::new(),
        }
    }

    /// Returns the store for `repo_id`, or `None` if no such repo exists on disk.
    pub fn get(&self, repo_id: &str) -> StoreResult<Option<Arc<FrameStore>>> {
        validate_repo_id(repo_id)?;
        if let Some(store) = self.stores.get(repo_id) {
            return Ok(Some(Arc::clone(store.value())));
        }

        if !self.root.join(repo_id).is_dir() {
            return Ok(None);
        }

        let entry = self.stores.entry(repo_id.to_string());
        let store = match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => Arc::clone(existing.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let opened = Arc::new(FrameStore::open(&self.root, repo_id)?);
                vacant.insert(Arc::clone(&opened));
                opened
            }
        };
        Ok(Some(store))
    }

    /// Creates (or reopens) the store for `repo_id`.
    pub fn create(&self, repo_id: &str) -> StoreResult<Arc<FrameStore>> {
        validate_repo_id(repo_id)?;
        let entry = self.stores.entry(repo_id.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let created = Arc::new(FrameStore::create(&self.root, repo_id)?);
                vacant.insert(Arc::clone(&created));
                Ok(created)
            }
        }
    }
}
