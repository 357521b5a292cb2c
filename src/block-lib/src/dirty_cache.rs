use crate::{
    BlockPointer, BranchName, DirtyBlockCache, DirtyBlockCacher, FileBlock, FolderBranch, FsError,
    FsResult, TlfId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

struct DirtyEntry {
    tlf: TlfId,
    branch: BranchName,
    block: FileBlock,
}

#[derive(Default)]
struct DirtyState {
    dirty: HashMap<BlockPointer, DirtyEntry>,
    synced: HashSet<BlockPointer>,
}

/// Process-wide dirty block cache.  A dirty binding lives from the
/// first `put` for a pointer until the pointer is synced (remapped to
/// its permanent id) or explicitly discarded.
#[derive(Default)]
pub struct DirtyBlockCacheStandard {
    state: Mutex<DirtyState>,
}

impl DirtyBlockCacheStandard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &self,
        tlf: TlfId,
        branch: &BranchName,
        ptr: BlockPointer,
        block: FileBlock,
    ) -> FsResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| FsError::Internal(format!("dirty cache lock poisoned: {}", e)))?;
        state.dirty.insert(
            ptr,
            DirtyEntry {
                tlf,
                branch: branch.clone(),
                block,
            },
        );
        Ok(())
    }

    pub fn get(&self, tlf: TlfId, branch: &BranchName, ptr: BlockPointer) -> Option<FileBlock> {
        let state = self.state.lock().ok()?;
        state.dirty.get(&ptr).and_then(|e| {
            if e.tlf == tlf && e.branch == *branch {
                Some(e.block.clone())
            } else {
                None
            }
        })
    }

    pub fn delete(&self, ptr: BlockPointer) {
        if let Ok(mut state) = self.state.lock() {
            state.dirty.remove(&ptr);
        }
    }

    /// Whether the put for `ptr`'s replacement block has completed.
    pub fn was_synced(&self, ptr: BlockPointer) -> bool {
        self.state
            .lock()
            .map(|s| s.synced.contains(&ptr))
            .unwrap_or(false)
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().map(|s| s.dirty.len()).unwrap_or(0)
    }
}

impl DirtyBlockCache for DirtyBlockCacheStandard {
    fn is_dirty(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> bool {
        self.state
            .lock()
            .map(|s| {
                s.dirty
                    .get(&ptr)
                    .map(|e| e.tlf == tlf && e.branch == *branch)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn set_not_dirty(&self, ptr: BlockPointer) {
        if let Ok(mut state) = self.state.lock() {
            state.dirty.remove(&ptr);
        }
    }

    fn set_synced(&self, ptr: BlockPointer) -> FsResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| FsError::Internal(format!("dirty cache lock poisoned: {}", e)))?;
        if state.dirty.remove(&ptr).is_none() {
            debug!("set_synced: {} was not dirty", ptr);
        }
        state.synced.insert(ptr);
        Ok(())
    }
}

/// Per-folder-branch cacher handle over the shared dirty cache, for
/// collaborators that only ever see bare pointers.
pub struct FolderDirtyCacher {
    cache: Arc<DirtyBlockCacheStandard>,
    folder_branch: FolderBranch,
}

impl FolderDirtyCacher {
    pub fn new(cache: Arc<DirtyBlockCacheStandard>, folder_branch: FolderBranch) -> Self {
        Self {
            cache,
            folder_branch,
        }
    }

    pub fn get(&self, ptr: BlockPointer) -> Option<FileBlock> {
        self.cache
            .get(self.folder_branch.tlf, &self.folder_branch.branch, ptr)
    }
}

impl DirtyBlockCacher for FolderDirtyCacher {
    fn cache(&self, ptr: BlockPointer, block: FileBlock) -> FsResult<()> {
        self.cache
            .put(self.folder_branch.tlf, &self.folder_branch.branch, ptr, block)
    }
}
