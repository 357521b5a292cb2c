use crate::{BlockUpdate, ConflictRenamer, Op, OpVariant, RootMetadata};
use block_lib::{BlockPointer, EntryType, FsResult, Path};
use std::collections::{HashMap, HashSet};

/// Everything known about one rename performed within a branch window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenameInfo {
    pub original_old_parent: BlockPointer,
    pub old_name: String,
    pub original_new_parent: BlockPointer,
    pub new_name: String,
}

/// The ordered operations affecting a single logical node within one
/// branch window, bracketed by the pointer it started the window with
/// and the one it ended with.
#[derive(Clone, Debug, Default)]
pub struct CrChain {
    pub original: BlockPointer,
    pub most_recent: BlockPointer,
    pub ops: Vec<Op>,
}

/// A resolution-level action to replay one side's change onto the
/// merged branch.
#[derive(Clone, Debug)]
pub enum CrAction {
    /// Copy the unmerged entry into the merged parent block.
    CopyUnmergedEntry { name: String, sym_path: String },
    /// Copy just an attribute change.
    CopyUnmergedAttr { name: String, attr: crate::AttrChange },
    /// Both sides claimed the name; the unmerged side loses and gets
    /// the conflict-tagged name.
    RenameUnmergedEntry { old_name: String, new_name: String },
    /// Replay the unmerged rm against the merged parent.
    RmMergedEntry { name: String },
    /// The unmerged op must not be replayed at all.
    DropUnmerged { op: Op },
}

impl CrChain {
    /// Pairs this unmerged chain's ops against the merged chain for
    /// the same node, minting loser-tagged names where two siblings
    /// collide.
    pub fn actions_to_merge(
        &self,
        renamer: &dyn ConflictRenamer,
        merged_path: &Path,
        merged_chain: Option<&CrChain>,
    ) -> FsResult<Vec<CrAction>> {
        let mut actions = Vec::new();
        for op in &self.ops {
            match &op.variant {
                OpVariant::Create {
                    new_name,
                    cr_sym_path,
                    ..
                } => {
                    let collides = merged_chain.map_or(false, |mc| {
                        mc.ops.iter().any(|mop| {
                            matches!(&mop.variant,
                                OpVariant::Create { new_name: mn, .. } if mn == new_name)
                        })
                    });
                    if collides {
                        actions.push(CrAction::RenameUnmergedEntry {
                            old_name: new_name.clone(),
                            new_name: renamer.conflict_rename(op, new_name),
                        });
                    } else {
                        actions.push(CrAction::CopyUnmergedEntry {
                            name: new_name.clone(),
                            sym_path: cr_sym_path.clone(),
                        });
                    }
                }
                OpVariant::Rm {
                    old_name,
                    drop_this,
                    ..
                } => {
                    if *drop_this {
                        actions.push(CrAction::DropUnmerged { op: op.clone() });
                    } else {
                        actions.push(CrAction::RmMergedEntry {
                            name: old_name.clone(),
                        });
                    }
                }
                OpVariant::SetAttr { name, attr, .. } => {
                    let collides = merged_chain.map_or(false, |mc| {
                        mc.ops.iter().any(|mop| {
                            matches!(&mop.variant,
                                OpVariant::SetAttr { name: mn, attr: ma, .. }
                                    if mn == name && ma == attr)
                        })
                    });
                    if collides {
                        actions.push(CrAction::RenameUnmergedEntry {
                            old_name: name.clone(),
                            new_name: renamer.conflict_rename(op, name),
                        });
                    } else {
                        actions.push(CrAction::CopyUnmergedAttr {
                            name: name.clone(),
                            attr: *attr,
                        });
                    }
                }
                OpVariant::Sync { .. } => {
                    let both_wrote = merged_chain.map_or(false, |mc| {
                        mc.ops
                            .iter()
                            .any(|mop| matches!(&mop.variant, OpVariant::Sync { .. }))
                    });
                    let name = merged_path.tail_name().to_string();
                    if both_wrote {
                        actions.push(CrAction::RenameUnmergedEntry {
                            old_name: name.clone(),
                            new_name: renamer.conflict_rename(op, &name),
                        });
                    } else {
                        actions.push(CrAction::CopyUnmergedEntry {
                            name,
                            sym_path: String::new(),
                        });
                    }
                }
                // Renames were split into create+rm while the chains
                // were built; bare renames and gc ops produce nothing.
                OpVariant::Rename { .. } | OpVariant::Gc => {}
            }
        }
        Ok(actions)
    }
}

/// Per-branch chain collection: one chain per logical node, indexed by
/// both the node's original pointer and its most recent one, plus the
/// branch-wide created/deleted/renamed bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct CrChains {
    chains: HashMap<BlockPointer, CrChain>,
    most_recent_index: HashMap<BlockPointer, BlockPointer>,
    pub created: HashSet<BlockPointer>,
    pub deleted: HashSet<BlockPointer>,
    pub renamed_originals: HashMap<BlockPointer, RenameInfo>,
}

impl CrChains {
    /// Builds the chains for one branch window by scanning each
    /// revision's ops in order.  An op either starts a chain (its
    /// unref pointer is unseen) or advances the matching chain's most
    /// recent pointer and appends itself.
    pub fn from_revisions(revisions: &[RootMetadata]) -> FsResult<CrChains> {
        let mut ccs = CrChains::default();
        for md in revisions {
            for op in &md.ops {
                ccs.make_chain_for_op(op)?;
            }
        }
        Ok(ccs)
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn original_from_most_recent(&self, most_recent: BlockPointer) -> Option<BlockPointer> {
        self.most_recent_index.get(&most_recent).copied()
    }

    pub fn most_recent_from_original(&self, original: BlockPointer) -> Option<BlockPointer> {
        self.chains.get(&original).map(|c| c.most_recent)
    }

    pub fn chain_by_original(&self, original: BlockPointer) -> Option<&CrChain> {
        self.chains.get(&original)
    }

    pub fn chain_by_original_mut(&mut self, original: BlockPointer) -> Option<&mut CrChain> {
        self.chains.get_mut(&original)
    }

    pub fn chain_by_most_recent(&self, most_recent: BlockPointer) -> Option<&CrChain> {
        self.original_from_most_recent(most_recent)
            .and_then(|orig| self.chains.get(&orig))
    }

    pub fn chain_by_most_recent_mut(&mut self, most_recent: BlockPointer) -> Option<&mut CrChain> {
        let orig = self.original_from_most_recent(most_recent)?;
        self.chains.get_mut(&orig)
    }

    pub fn iter_by_most_recent(&self) -> impl Iterator<Item = (BlockPointer, &CrChain)> {
        self.chains.values().map(|c| (c.most_recent, c))
    }

    pub fn all_most_recent(&self) -> HashSet<BlockPointer> {
        self.chains.values().map(|c| c.most_recent).collect()
    }

    pub fn is_created(&self, original: BlockPointer) -> bool {
        self.created.contains(&original)
    }

    pub fn is_deleted(&self, original: BlockPointer) -> bool {
        self.deleted.contains(&original)
    }

    pub fn renamed_parent_and_name(
        &self,
        original: BlockPointer,
    ) -> Option<(BlockPointer, String)> {
        self.renamed_originals
            .get(&original)
            .map(|info| (info.original_new_parent, info.new_name.clone()))
    }

    /// Drops the chain whose most recent pointer is `most_recent`
    /// (e.g. because the node became unreachable in its branch).
    pub fn remove_chain(&mut self, most_recent: BlockPointer) {
        if let Some(orig) = self.most_recent_index.remove(&most_recent) {
            self.chains.remove(&orig);
        }
    }

    /// Sets the resolved path on every op of the chain at
    /// `most_recent`, if there is one.
    pub fn set_final_paths_by_most_recent(&mut self, most_recent: BlockPointer, path: &Path) {
        if let Some(chain) = self.chain_by_most_recent_mut(most_recent) {
            for op in chain.ops.iter_mut() {
                op.set_final_path(path);
            }
        }
    }

    fn original_of(&self, ptr: BlockPointer) -> BlockPointer {
        self.original_from_most_recent(ptr).unwrap_or(ptr)
    }

    /// Advances (or starts) the chain touched by one pointer update.
    fn advance(&mut self, update: BlockUpdate) {
        if !update.unref.is_valid() && !update.reference.is_valid() {
            return;
        }
        let original = match self.most_recent_index.remove(&update.unref) {
            Some(orig) => orig,
            None => update.unref,
        };
        let chain = self.chains.entry(original).or_insert_with(|| CrChain {
            original,
            most_recent: original,
            ops: Vec::new(),
        });
        chain.most_recent = update.reference;
        self.most_recent_index.insert(update.reference, original);
    }

    fn append_op(&mut self, most_recent: BlockPointer, op: Op) -> FsResult<()> {
        let chain = self.chain_by_most_recent_mut(most_recent).ok_or_else(|| {
            block_lib::FsError::Internal(format!("no chain to append op to at {}", most_recent))
        })?;
        chain.ops.push(op);
        Ok(())
    }

    /// Folds one op into the chains: pointer updates first, then the
    /// op itself onto the chain of the node it modified.  Renames are
    /// materialized as a renamed-create in the new parent plus an rm
    /// in the old parent, with `renamed_originals` keeping the
    /// mapping.
    pub fn make_chain_for_op(&mut self, op: &Op) -> FsResult<()> {
        for update in op.all_updates() {
            self.advance(update);
        }

        match &op.variant {
            OpVariant::Create { dir, .. } => {
                self.append_op(dir.reference, op.clone())?;
                let refs = op.common.refs.clone();
                for r in refs {
                    let orig = self.original_of(r);
                    self.created.insert(orig);
                }
            }
            OpVariant::Rm { dir, .. } => {
                self.append_op(dir.reference, op.clone())?;
                let unrefs = op.common.unrefs.clone();
                for u in unrefs {
                    let orig = self.original_of(u);
                    self.deleted.insert(orig);
                }
            }
            OpVariant::Rename {
                old_dir,
                new_dir,
                old_name,
                new_name,
                renamed,
            } => {
                let nd = (*new_dir).unwrap_or(*old_dir);

                let mut cop = Op::create(nd, new_name, EntryType::File);
                if let OpVariant::Create { renamed, .. } = &mut cop.variant {
                    *renamed = true;
                }
                cop.common.writer_name = op.common.writer_name.clone();
                cop.common.timestamp = op.common.timestamp;
                cop.common.refs = op.common.refs.clone();
                self.append_op(nd.reference, cop)?;

                let mut rop = Op::rm(*old_dir, old_name);
                rop.common.writer_name = op.common.writer_name.clone();
                rop.common.timestamp = op.common.timestamp;
                self.append_op(old_dir.reference, rop)?;

                let renamed_original = self.original_of(*renamed);
                // A node moved more than once keeps its very first
                // origin.
                let (first_old_parent, first_old_name) =
                    match self.renamed_originals.get(&renamed_original) {
                        Some(prev) => (prev.original_old_parent, prev.old_name.clone()),
                        None => (self.original_of(old_dir.unref), old_name.clone()),
                    };
                self.renamed_originals.insert(
                    renamed_original,
                    RenameInfo {
                        original_old_parent: first_old_parent,
                        old_name: first_old_name,
                        original_new_parent: self.original_of(nd.unref),
                        new_name: new_name.clone(),
                    },
                );
            }
            OpVariant::Sync { file, .. } => {
                self.append_op(file.reference, op.clone())?;
            }
            OpVariant::SetAttr { dir, .. } => {
                self.append_op(dir.reference, op.clone())?;
            }
            OpVariant::Gc => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriterDateConflictRenamer;
    use block_lib::{BlockId, FolderBranch, MetadataRevision, PathNode};

    fn ptr(seed: u8) -> BlockPointer {
        let mut p = BlockPointer::default();
        p.id = BlockId::from_hash(&[seed]);
        p
    }

    fn upd(a: u8, b: u8) -> BlockUpdate {
        BlockUpdate::new(ptr(a), ptr(b))
    }

    #[test]
    fn test_chains_follow_updates_across_revisions() {
        // rev 1: create /f in dir D (D1 -> D2), rev 2: sync /f.
        let create = Op::create(upd(10, 11), "f", EntryType::File).with_refs(vec![ptr(20)]);
        let sync = Op::sync(upd(20, 21), vec![]).with_updates(vec![upd(11, 12)]);
        let revs = vec![
            RootMetadata::new(MetadataRevision(1), ptr(1), vec![create]),
            RootMetadata::new(MetadataRevision(2), ptr(1), vec![sync]),
        ];
        let ccs = CrChains::from_revisions(&revs).unwrap();

        // The dir chain covers D1 -> D12 with one op.
        assert_eq!(ccs.most_recent_from_original(ptr(10)), Some(ptr(12)));
        assert_eq!(ccs.original_from_most_recent(ptr(12)), Some(ptr(10)));
        let dchain = ccs.chain_by_original(ptr(10)).unwrap();
        assert_eq!(dchain.ops.len(), 1);

        // The file chain starts at its created pointer.
        assert!(ccs.is_created(ptr(20)));
        assert_eq!(ccs.most_recent_from_original(ptr(20)), Some(ptr(21)));
        let fchain = ccs.chain_by_most_recent(ptr(21)).unwrap();
        assert_eq!(fchain.ops.len(), 1);
    }

    #[test]
    fn test_rm_marks_deleted_by_original() {
        let sync = Op::sync(upd(20, 21), vec![]);
        let rm = Op::rm(upd(10, 11), "f").with_unrefs(vec![ptr(21)]);
        let revs = vec![RootMetadata::new(
            MetadataRevision(1),
            ptr(1),
            vec![sync, rm],
        )];
        let ccs = CrChains::from_revisions(&revs).unwrap();
        // The unref'd pointer maps back to the chain's original.
        assert!(ccs.is_deleted(ptr(20)));
        assert!(!ccs.is_deleted(ptr(21)));
    }

    #[test]
    fn test_rename_splits_into_create_and_rm() {
        let rename = Op::rename(upd(10, 11), Some(upd(30, 31)), "a", "b", ptr(40));
        let revs = vec![RootMetadata::new(MetadataRevision(1), ptr(1), vec![rename])];
        let ccs = CrChains::from_revisions(&revs).unwrap();

        let new_parent = ccs.chain_by_original(ptr(30)).unwrap();
        assert!(matches!(
            &new_parent.ops[0].variant,
            OpVariant::Create { new_name, renamed: true, .. } if new_name == "b"
        ));
        let old_parent = ccs.chain_by_original(ptr(10)).unwrap();
        assert!(matches!(
            &old_parent.ops[0].variant,
            OpVariant::Rm { old_name, .. } if old_name == "a"
        ));

        let info = ccs.renamed_originals.get(&ptr(40)).unwrap();
        assert_eq!(info.original_old_parent, ptr(10));
        assert_eq!(info.old_name, "a");
        assert_eq!(info.original_new_parent, ptr(30));
        assert_eq!(info.new_name, "b");
        assert_eq!(
            ccs.renamed_parent_and_name(ptr(40)),
            Some((ptr(30), "b".to_string()))
        );
    }

    #[test]
    fn test_double_rename_keeps_first_origin() {
        let mv1 = Op::rename(upd(10, 11), Some(upd(30, 31)), "a", "b", ptr(40));
        let mv2 = Op::rename(upd(31, 32), Some(upd(50, 51)), "b", "c", ptr(40));
        let revs = vec![RootMetadata::new(
            MetadataRevision(1),
            ptr(1),
            vec![mv1, mv2],
        )];
        let ccs = CrChains::from_revisions(&revs).unwrap();
        let info = ccs.renamed_originals.get(&ptr(40)).unwrap();
        assert_eq!(info.original_old_parent, ptr(10));
        assert_eq!(info.old_name, "a");
        assert_eq!(info.original_new_parent, ptr(50));
        assert_eq!(info.new_name, "c");
    }

    fn merged_path_for(tail: BlockPointer, name: &str) -> Path {
        Path::new(
            FolderBranch::default(),
            vec![
                PathNode {
                    ptr: ptr(1),
                    name: "tlf".to_string(),
                },
                PathNode {
                    ptr: tail,
                    name: name.to_string(),
                },
            ],
        )
    }

    #[test]
    fn test_actions_create_collision_renames_loser() {
        let renamer = WriterDateConflictRenamer;
        let unmerged = CrChain {
            original: ptr(10),
            most_recent: ptr(11),
            ops: vec![
                Op::create(upd(10, 11), "f", EntryType::File).with_writer("bob", 99)
            ],
        };
        let merged = CrChain {
            original: ptr(10),
            most_recent: ptr(12),
            ops: vec![Op::create(upd(10, 12), "f", EntryType::File)],
        };
        let path = merged_path_for(ptr(12), "d");
        let actions = unmerged
            .actions_to_merge(&renamer, &path, Some(&merged))
            .unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            CrAction::RenameUnmergedEntry { old_name, new_name } => {
                assert_eq!(old_name, "f");
                assert_eq!(new_name, "f.conflict.bob.99");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_actions_no_collision_copies_entry() {
        let renamer = WriterDateConflictRenamer;
        let unmerged = CrChain {
            original: ptr(10),
            most_recent: ptr(11),
            ops: vec![Op::create(upd(10, 11), "f", EntryType::File)],
        };
        let path = merged_path_for(ptr(10), "d");
        let actions = unmerged.actions_to_merge(&renamer, &path, None).unwrap();
        assert!(matches!(
            &actions[0],
            CrAction::CopyUnmergedEntry { name, .. } if name == "f"
        ));
    }

    #[test]
    fn test_actions_both_wrote_file_renames_unmerged_copy() {
        let renamer = WriterDateConflictRenamer;
        let unmerged = CrChain {
            original: ptr(20),
            most_recent: ptr(21),
            ops: vec![Op::sync(upd(20, 21), vec![]).with_writer("carol", 7)],
        };
        let merged = CrChain {
            original: ptr(20),
            most_recent: ptr(22),
            ops: vec![Op::sync(upd(20, 22), vec![])],
        };
        let path = merged_path_for(ptr(22), "f");
        let actions = unmerged
            .actions_to_merge(&renamer, &path, Some(&merged))
            .unwrap();
        assert!(matches!(
            &actions[0],
            CrAction::RenameUnmergedEntry { new_name, .. } if new_name == "f.conflict.carol.7"
        ));
    }
}
