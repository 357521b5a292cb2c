use block_lib::{zero_ptr, BlockPointer, EntryType, MetadataRevision, Path};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which attribute a setAttr operation changed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AttrChange {
    Exec,
    Mtime,
    Size,
}

impl fmt::Display for AttrChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrChange::Exec => write!(f, "exec"),
            AttrChange::Mtime => write!(f, "mtime"),
            AttrChange::Size => write!(f, "size"),
        }
    }
}

/// An old pointer retired by an operation, and the new pointer that
/// replaces it.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub unref: BlockPointer,
    pub reference: BlockPointer,
}

impl BlockUpdate {
    pub fn new(unref: BlockPointer, reference: BlockPointer) -> Self {
        Self { unref, reference }
    }
}

/// A contiguous byte range written by a sync operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

/// Fields shared by every operation: the pointers it brings into
/// existence and retires, the ancestor directory updates it implies,
/// and its attribution.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct OpCommon {
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
    pub writer_name: String,
    pub timestamp: u64,
    #[serde(skip)]
    pub final_path: Path,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OpVariant {
    Create {
        dir: BlockUpdate,
        new_name: String,
        entry_type: EntryType,
        /// True when this create is one half of a rename.
        renamed: bool,
        /// Symlink target filled in when conflict resolution turns
        /// this create into a symlink to break a rename cycle.
        cr_sym_path: String,
    },
    Rm {
        dir: BlockUpdate,
        old_name: String,
        /// Set during conflict resolution when this rm must not be
        /// replayed on the merged branch.
        drop_this: bool,
    },
    Rename {
        old_dir: BlockUpdate,
        /// None when the rename stays within one directory.
        new_dir: Option<BlockUpdate>,
        old_name: String,
        new_name: String,
        /// The node being moved.
        renamed: BlockPointer,
    },
    Sync {
        file: BlockUpdate,
        writes: Vec<WriteRange>,
    },
    SetAttr {
        dir: BlockUpdate,
        name: String,
        attr: AttrChange,
    },
    Gc,
}

/// One typed operation within a metadata revision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Op {
    pub common: OpCommon,
    pub variant: OpVariant,
}

impl Op {
    fn with_variant(variant: OpVariant) -> Self {
        Self {
            common: OpCommon::default(),
            variant,
        }
    }

    pub fn create(dir: BlockUpdate, new_name: &str, entry_type: EntryType) -> Self {
        Self::with_variant(OpVariant::Create {
            dir,
            new_name: new_name.to_string(),
            entry_type,
            renamed: false,
            cr_sym_path: String::new(),
        })
    }

    /// A create synthesized during conflict resolution to bring back a
    /// directory that was deleted on the merged branch.  Only the old
    /// pointer is known at this point.
    pub fn recreate(parent: BlockPointer, name: &str, entry_type: EntryType) -> Self {
        Self::create(BlockUpdate::new(parent, zero_ptr()), name, entry_type)
    }

    pub fn rm(dir: BlockUpdate, old_name: &str) -> Self {
        Self::with_variant(OpVariant::Rm {
            dir,
            old_name: old_name.to_string(),
            drop_this: false,
        })
    }

    pub fn rename(
        old_dir: BlockUpdate,
        new_dir: Option<BlockUpdate>,
        old_name: &str,
        new_name: &str,
        renamed: BlockPointer,
    ) -> Self {
        Self::with_variant(OpVariant::Rename {
            old_dir,
            new_dir,
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
            renamed,
        })
    }

    pub fn sync(file: BlockUpdate, writes: Vec<WriteRange>) -> Self {
        Self::with_variant(OpVariant::Sync { file, writes })
    }

    pub fn set_attr(dir: BlockUpdate, name: &str, attr: AttrChange) -> Self {
        Self::with_variant(OpVariant::SetAttr {
            dir,
            name: name.to_string(),
            attr,
        })
    }

    pub fn gc() -> Self {
        Self::with_variant(OpVariant::Gc)
    }

    pub fn with_refs(mut self, refs: Vec<BlockPointer>) -> Self {
        self.common.refs = refs;
        self
    }

    pub fn with_unrefs(mut self, unrefs: Vec<BlockPointer>) -> Self {
        self.common.unrefs = unrefs;
        self
    }

    pub fn with_updates(mut self, updates: Vec<BlockUpdate>) -> Self {
        self.common.updates = updates;
        self
    }

    pub fn with_writer(mut self, writer_name: &str, timestamp: u64) -> Self {
        self.common.writer_name = writer_name.to_string();
        self.common.timestamp = timestamp;
        self
    }

    /// The primary update of this op's variant, if any: the directory
    /// (or file) whose block the operation rewrote.
    pub fn primary_update(&self) -> Option<BlockUpdate> {
        match &self.variant {
            OpVariant::Create { dir, .. }
            | OpVariant::Rm { dir, .. }
            | OpVariant::SetAttr { dir, .. } => Some(*dir),
            OpVariant::Rename { old_dir, .. } => Some(*old_dir),
            OpVariant::Sync { file, .. } => Some(*file),
            OpVariant::Gc => None,
        }
    }

    pub fn set_primary_update(&mut self, update: BlockUpdate) {
        match &mut self.variant {
            OpVariant::Create { dir, .. }
            | OpVariant::Rm { dir, .. }
            | OpVariant::SetAttr { dir, .. } => *dir = update,
            OpVariant::Rename { old_dir, .. } => *old_dir = update,
            OpVariant::Sync { file, .. } => *file = update,
            OpVariant::Gc => {}
        }
    }

    /// Every pointer update this op performs: the variant's primary
    /// update(s) plus the ancestor directory updates along its path.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut updates = self.common.updates.clone();
        match &self.variant {
            OpVariant::Create { dir, .. }
            | OpVariant::Rm { dir, .. }
            | OpVariant::SetAttr { dir, .. } => updates.push(*dir),
            OpVariant::Rename {
                old_dir, new_dir, ..
            } => {
                updates.push(*old_dir);
                if let Some(nd) = new_dir {
                    updates.push(*nd);
                }
            }
            OpVariant::Sync { file, .. } => updates.push(*file),
            OpVariant::Gc => {}
        }
        updates
    }

    pub fn set_final_path(&mut self, path: &Path) {
        self.common.final_path = path.clone();
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            OpVariant::Create { new_name, .. } => write!(f, "create {}", new_name),
            OpVariant::Rm { old_name, .. } => write!(f, "rm {}", old_name),
            OpVariant::Rename {
                old_name, new_name, ..
            } => write!(f, "rename {} -> {}", old_name, new_name),
            OpVariant::Sync { writes, .. } => write!(f, "sync ({} writes)", writes.len()),
            OpVariant::SetAttr { name, attr, .. } => write!(f, "setAttr {} ({})", name, attr),
            OpVariant::Gc => write!(f, "gc"),
        }
    }
}

/// One linearized revision of a folder branch's metadata: the root
/// pointer as of this revision and the ordered operations it applied.
#[derive(Clone, Debug)]
pub struct RootMetadata {
    pub revision: MetadataRevision,
    pub root: BlockPointer,
    pub ops: Vec<Op>,
}

impl RootMetadata {
    pub fn new(revision: MetadataRevision, root: BlockPointer, ops: Vec<Op>) -> Self {
        Self {
            revision,
            root,
            ops,
        }
    }
}
