use crate::{BlockReadier, SyncHook};
use block_lib::{
    default_new_block_data_version, BlockContext, BlockInfo, BlockPointer, BlockReqType,
    BlockSplitter, CryptoPure, DataVer, DirEntry, DirtyBlockCache, DirtyBlockCacher, FileBlock,
    FileBlockGetter, FsError, FsResult, IndirectFilePtr, KeyGen, OpCtx, Path, UserId,
};
use futures::future::{join_all, BoxFuture};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The amount the read path trims off an inherited deadline, so an
/// imminent outer deadline yields a partial prefix instead of nothing.
pub const READ_TIMEOUT_SMALLER_BY: Duration = Duration::from_secs(2);

/// One step on a path down the file tree: an indirect block and the
/// index of the child the path continues through.  Parents are only
/// ever reached by carrying them on this stack during a traversal; no
/// upward pointer is stored in any block.
#[derive(Clone, Debug, Default)]
pub struct ParentBlockAndChildIndex {
    pub pblock: FileBlock,
    pub child_index: usize,
}

impl ParentBlockAndChildIndex {
    pub fn child_iptr(&self) -> IndirectFilePtr {
        self.pblock.iptrs[self.child_index]
    }
}

/// Result of locating the leaf holding a given offset.
pub struct BlockAtOffset {
    pub ptr: BlockPointer,
    pub parents: Vec<ParentBlockAndChildIndex>,
    pub block: FileBlock,
    /// Offset of the following leaf, or -1 if this is the rightmost.
    pub next_block_start_off: i64,
    pub start_off: i64,
    pub was_dirty: bool,
}

/// Result of locating the next dirty leaf at or after an offset.
pub struct DirtyBlockAtOffset {
    pub ptr: BlockPointer,
    pub parents: Vec<ParentBlockAndChildIndex>,
    pub block: FileBlock,
    pub next_block_start_off: i64,
    pub start_off: i64,
}

struct LeafRange {
    paths_from_root: Vec<Vec<ParentBlockAndChildIndex>>,
    blocks: HashMap<BlockPointer, FileBlock>,
    next_block_offset: i64,
}

/// Everything a write changed, for the caller to fold into the next
/// sync.
pub struct WriteResult {
    pub new_de: DirEntry,
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    pub newly_dirtied_child_bytes: i64,
    pub bytes_extended: i64,
}

/// Result of a shrinking truncate.
pub struct TruncateResult {
    pub new_de: DirEntry,
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    pub newly_dirtied_child_bytes: i64,
}

/// Accessor for the data within a single file, addressed by the root
/// pointer at the tail of `file`.  Meant for use within a single
/// operation, not for long-term storage; the surrounding folder-branch
/// lock must serialize all mutating calls.
pub struct FileData {
    file: Path,
    uid: UserId,
    key_gen: KeyGen,
    bsplit: Arc<dyn BlockSplitter>,
    crypto: Arc<dyn CryptoPure>,
    getter: Arc<dyn FileBlockGetter>,
    cacher: Arc<dyn DirtyBlockCacher>,
}

impl FileData {
    pub fn new(
        file: Path,
        uid: UserId,
        key_gen: KeyGen,
        bsplit: Arc<dyn BlockSplitter>,
        crypto: Arc<dyn CryptoPure>,
        getter: Arc<dyn FileBlockGetter>,
        cacher: Arc<dyn DirtyBlockCacher>,
    ) -> Self {
        Self {
            file,
            uid,
            key_gen,
            bsplit,
            crypto,
            getter,
            cacher,
        }
    }

    pub fn root_block_pointer(&self) -> BlockPointer {
        self.file.tail_pointer()
    }

    fn new_block_pointer(&self, dver: DataVer) -> FsResult<BlockPointer> {
        Ok(BlockPointer {
            id: self.crypto.make_temporary_block_id()?,
            key_gen: self.key_gen,
            data_ver: dver,
            context: BlockContext::first(self.uid),
        })
    }

    async fn get_top_block(&self, ctx: &OpCtx, req: BlockReqType) -> FsResult<FileBlock> {
        let (block, _) = self
            .getter
            .get_file_block(ctx, self.root_block_pointer(), &self.file, req)
            .await?;
        Ok(block)
    }

    /// Returns the leaf block containing `off`, along with the
    /// indirect blocks leading to it.  At each indirect level the
    /// first child with an offset >= `off` decides the descent: on
    /// strict equality descend through it, otherwise through its left
    /// sibling (child offsets partition the file, so the predecessor
    /// holds `off`).
    pub async fn get_block_at_offset(
        &self,
        ctx: &OpCtx,
        top_block: &FileBlock,
        off: i64,
        req: BlockReqType,
    ) -> FsResult<BlockAtOffset> {
        let mut ptr = self.root_block_pointer();
        let mut block = top_block.clone();
        let mut next_block_start_off = -1i64;
        let mut start_off = 0i64;
        let mut parents: Vec<ParentBlockAndChildIndex> = Vec::new();

        if !block.is_ind {
            // Just need to find out whether the root is dirty.
            let (_, was_dirty) = self.getter.get_file_block(ctx, ptr, &self.file, req).await?;
            return Ok(BlockAtOffset {
                ptr,
                parents,
                block,
                next_block_start_off,
                start_off,
                was_dirty,
            });
        }

        let mut was_dirty = false;
        while block.is_ind {
            let mut next_index = block.iptrs.len() - 1;
            for (i, iptr) in block.iptrs.iter().enumerate() {
                if iptr.off == off {
                    next_index = i;
                    break;
                } else if iptr.off > off {
                    // i can never be 0; the first child always starts
                    // at the beginning of the range.
                    next_index = i - 1;
                    break;
                }
            }
            let next_ptr = block.iptrs[next_index];
            // There is more to read if we ever took a path through a
            // non-final child.
            if next_index != block.iptrs.len() - 1 {
                next_block_start_off = block.iptrs[next_index + 1].off;
            }
            parents.push(ParentBlockAndChildIndex {
                pblock: block,
                child_index: next_index,
            });
            start_off = next_ptr.off;
            ptr = next_ptr.info.pointer;
            let (b, wd) = self.getter.get_file_block(ctx, ptr, &self.file, req).await?;
            block = b;
            was_dirty = wd;
        }

        Ok(BlockAtOffset {
            ptr,
            parents,
            block,
            next_block_start_off,
            start_off,
            was_dirty,
        })
    }

    /// Returns the next dirty leaf with a starting offset at or after
    /// `off`, or None.  Relies on the invariant that dirtying a leaf
    /// dirties all of its parents, so following dirty children is both
    /// sufficient and complete.  Iterate by feeding
    /// `next_block_start_off` back in as `off` until it goes negative.
    pub async fn get_next_dirty_block_at_offset(
        &self,
        ctx: &OpCtx,
        top_block: &FileBlock,
        off: i64,
        req: BlockReqType,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
    ) -> FsResult<Option<DirtyBlockAtOffset>> {
        let fb = &self.file.folder_branch;
        let mut ptr = self.root_block_pointer();
        if !dirty_bcache.is_dirty(fb.tlf, ptr, &fb.branch) {
            // The root isn't dirty, so no leaf is.
            return Ok(None);
        }

        let mut block = top_block.clone();
        let mut next_block_start_off = -1i64;
        let mut start_off = 0i64;
        let mut parents: Vec<ParentBlockAndChildIndex> = Vec::new();
        let mut checked_prev_block = false;
        while block.is_ind {
            let mut index = None;
            for i in 0..block.iptrs.len() {
                let iptr = block.iptrs[i];
                if iptr.off < off {
                    continue;
                }

                if iptr.off == off {
                    // No need to look left when aligned exactly.
                    checked_prev_block = true;
                }

                // The previous block contains `off`; look there first.
                if !checked_prev_block
                    && dirty_bcache.is_dirty(fb.tlf, block.iptrs[i - 1].info.pointer, &fb.branch)
                {
                    index = Some(i - 1);
                    break;
                }
                checked_prev_block = true;

                if dirty_bcache.is_dirty(fb.tlf, iptr.info.pointer, &fb.branch) {
                    index = Some(i);
                    break;
                }
            }

            let Some(index) = index else {
                // No dirty block at or after `off`.
                return Ok(None);
            };

            let iptr = block.iptrs[index];
            if index != block.iptrs.len() - 1 {
                next_block_start_off = block.iptrs[index + 1].off;
            }
            parents.push(ParentBlockAndChildIndex {
                pblock: block,
                child_index: index,
            });
            start_off = iptr.off;
            ptr = iptr.info.pointer;
            let (b, _) = self.getter.get_file_block(ctx, ptr, &self.file, req).await?;
            block = b;
        }

        Ok(Some(DirtyBlockAtOffset {
            ptr,
            parents,
            block,
            next_block_start_off,
            start_off,
        }))
    }

    /// Fetches all leaf blocks covering the half-open range
    /// `[start_off, end_off)` (to EOF when `end_off` is -1), in
    /// parallel across the children of each indirect block.  Returns
    /// offset-ordered paths from the root, a pointer-to-leaf map, and
    /// the offset of the first block past the range (-1 if none).  A
    /// deadline failure in one child cancels its peers; with
    /// `prefix_ok` the successfully gathered prefix is kept instead.
    fn get_leaf_blocks_for_range(
        &self,
        ctx: OpCtx,
        ptr: BlockPointer,
        pblock: FileBlock,
        start_off: i64,
        end_off: i64,
        prefix_ok: bool,
    ) -> BoxFuture<'_, FsResult<LeafRange>> {
        Box::pin(async move {
            if !pblock.is_ind {
                // The caller already checked the range for this block.
                let mut blocks = HashMap::new();
                blocks.insert(ptr, pblock);
                return Ok(LeafRange {
                    paths_from_root: vec![Vec::new()],
                    blocks,
                    next_block_offset: -1,
                });
            }

            let child_scope = ctx.child();
            let mut next_block_offset_this_level = -1i64;
            let mut fetches = Vec::new();
            for (i, iptr) in pblock.iptrs.iter().enumerate() {
                // Some byte of this child is left of the range end of
                // the next sibling's start.
                let in_range_left = if i < pblock.iptrs.len() - 1 {
                    start_off < pblock.iptrs[i + 1].off
                } else {
                    true
                };
                if !in_range_left {
                    continue;
                }
                let in_range_right = end_off == -1 || end_off > iptr.off;
                if !in_range_right {
                    // First sibling past the range at this level.
                    next_block_offset_this_level = iptr.off;
                    break;
                }

                let child_ptr = iptr.info.pointer;
                let child_index = i;
                let cctx = child_scope.clone();
                let pblock_for_path = pblock.clone();
                fetches.push(async move {
                    let res: FsResult<LeafRange> = async {
                        let (block, _) = self
                            .getter
                            .get_file_block(&cctx, child_ptr, &self.file, BlockReqType::ReadParallel)
                            .await?;
                        let mut lr = self
                            .get_leaf_blocks_for_range(
                                cctx.clone(),
                                child_ptr,
                                block,
                                start_off,
                                end_off,
                                prefix_ok,
                            )
                            .await?;
                        // Prepend self to every returned path.
                        for p in lr.paths_from_root.iter_mut() {
                            p.insert(
                                0,
                                ParentBlockAndChildIndex {
                                    pblock: pblock_for_path.clone(),
                                    child_index,
                                },
                            );
                        }
                        Ok(lr)
                    }
                    .await;
                    if res.is_err() {
                        // First failure cancels the sibling fetches.
                        cctx.cancel();
                    }
                    res
                });
            }

            let results = join_all(fetches).await;

            let mut paths_from_root = Vec::new();
            let mut blocks = HashMap::new();
            let mut min_next_block_offset_child = -1i64;
            for res in results {
                match res {
                    Ok(lr) => {
                        paths_from_root.extend(lr.paths_from_root);
                        blocks.extend(lr.blocks);
                        // Track the leftmost offset past the range.
                        if lr.next_block_offset != -1
                            && (min_next_block_offset_child == -1
                                || lr.next_block_offset < min_next_block_offset_child)
                        {
                            min_next_block_offset_child = lr.next_block_offset;
                        }
                    }
                    Err(e) if prefix_ok && e.is_deadline() => break,
                    Err(e) => return Err(e),
                }
            }

            let next_block_offset = if next_block_offset_this_level == -1 {
                min_next_block_offset_child
            } else if min_next_block_offset_child != -1
                && min_next_block_offset_child < next_block_offset_this_level
            {
                min_next_block_offset_child
            } else {
                next_block_offset_this_level
            };

            Ok(LeafRange {
                paths_from_root,
                blocks,
                next_block_offset,
            })
        })
    }

    async fn get_indirect_blocks_for_range(
        &self,
        ctx: &OpCtx,
        top_block: &FileBlock,
        start_off: i64,
        end_off: i64,
    ) -> FsResult<Vec<Vec<ParentBlockAndChildIndex>>> {
        let lr = self
            .get_leaf_blocks_for_range(
                ctx.clone(),
                self.root_block_pointer(),
                top_block.clone(),
                start_off,
                end_off,
                false,
            )
            .await?;
        Ok(lr.paths_from_root)
    }

    /// Returns an ordered list of byte slices for `[start_off,
    /// end_off)` (to EOF when `end_off` is -1), synthesizing zero-fill
    /// buffers over every hole.  The caller concatenates if desired.
    pub async fn get_byte_slices_in_range(
        &self,
        ctx: &OpCtx,
        start_off: i64,
        end_off: i64,
        prefix_ok: bool,
    ) -> FsResult<Vec<Vec<u8>>> {
        if start_off < 0 || end_off < -1 {
            return Err(FsError::Internal(format!(
                "bad offset range [{}, {})",
                start_off, end_off
            )));
        } else if end_off != -1 && end_off <= start_off {
            return Ok(Vec::new());
        }

        let top_block = self.get_top_block(ctx, BlockReqType::Read).await?;

        // Find all indirect pointers to leaves in the offset range.
        let mut iptrs: Vec<IndirectFilePtr> = Vec::new();
        let mut end_block_off = -1i64;
        let mut next_block_off = -1i64;
        let block_map: HashMap<BlockPointer, FileBlock>;
        if top_block.is_ind {
            let lr = self
                .get_leaf_blocks_for_range(
                    ctx.clone(),
                    self.root_block_pointer(),
                    top_block,
                    start_off,
                    end_off,
                    prefix_ok,
                )
                .await?;
            next_block_off = lr.next_block_offset;
            let n_paths = lr.paths_from_root.len();
            for (i, p) in lr.paths_from_root.iter().enumerate() {
                let lowest_ancestor = p.last().ok_or_else(|| {
                    FsError::Internal(format!(
                        "unexpected empty path to child for file {}",
                        self.root_block_pointer()
                    ))
                })?;
                let iptr = lowest_ancestor.child_iptr();
                if i == n_paths - 1 {
                    let leaf = lr
                        .blocks
                        .get(&iptr.info.pointer)
                        .ok_or(FsError::NoSuchBlock(iptr.info.pointer.id))?;
                    end_block_off = iptr.off + leaf.contents.len() as i64;
                }
                iptrs.push(iptr);
            }
            block_map = lr.blocks;
        } else {
            iptrs.push(IndirectFilePtr {
                info: BlockInfo {
                    pointer: self.root_block_pointer(),
                    encoded_size: 0,
                },
                off: 0,
                holes: false,
            });
            end_block_off = top_block.contents.len() as i64;
            let mut m = HashMap::new();
            m.insert(self.root_block_pointer(), top_block);
            block_map = m;
        }

        if iptrs.is_empty() {
            return Ok(Vec::new());
        }

        let mut n_read = 0i64;
        let n = if end_off == -1 {
            end_block_off - start_off
        } else {
            end_off - start_off
        };

        // Grab the relevant bytes from each leaf, filling in holes.
        let mut slices: Vec<Vec<u8>> = Vec::new();
        for iptr in &iptrs {
            let block = block_map
                .get(&iptr.info.pointer)
                .ok_or(FsError::NoSuchBlock(iptr.info.pointer.id))?;
            let block_len = block.contents.len() as i64;
            let mut next_byte = n_read + start_off;
            let mut to_read = n - n_read;
            let block_off = iptr.off;
            let last_byte_in_block = block_off + block_len;

            if next_byte >= last_byte_in_block {
                if next_block_off > 0 {
                    let mut fill = next_block_off - next_byte;
                    if fill > to_read {
                        fill = to_read;
                    }
                    debug!(
                        "read from hole: next_byte={} last_byte_in_block={} fill={}",
                        next_byte, last_byte_in_block, fill
                    );
                    if fill <= 0 {
                        error!("read invalid file fill <= 0 while reading hole");
                        return Err(FsError::BadSplit);
                    }
                    slices.push(vec![0u8; fill as usize]);
                    n_read += fill;
                    continue;
                }
                return Ok(slices);
            } else if to_read > last_byte_in_block - next_byte {
                to_read = last_byte_in_block - next_byte;
            }

            // A hole in the middle of the file.
            if next_byte < block_off {
                let fill = block_off - next_byte;
                slices.push(vec![0u8; fill as usize]);
                n_read += fill;
                next_byte += fill;
                to_read -= fill;
            }

            let first_byte_to_read = (next_byte - block_off) as usize;
            slices.push(
                block.contents[first_byte_to_read..first_byte_to_read + to_read as usize].to_vec(),
            );
            n_read += to_read;
        }

        // An incomplete read with a following block means a trailing
        // hole needs one more fill.
        if n_read < n && next_block_off > 0 {
            let to_read = n - n_read;
            let next_byte = n_read + start_off;
            let mut fill = next_block_off - next_byte;
            if fill > to_read {
                fill = to_read;
            }
            debug!(
                "read from hole at end of file: next_byte={} fill={}",
                next_byte, fill
            );
            if fill <= 0 {
                error!("read invalid file fill <= 0 while reading hole");
                return Err(FsError::BadSplit);
            }
            slices.push(vec![0u8; fill as usize]);
        }

        Ok(slices)
    }

    /// Fills `dest` with file data starting at `start_off`, returning
    /// the number of bytes copied.  If the context deadline is close,
    /// a shorter subordinate deadline is used so that a partial prefix
    /// is returned instead of nothing.
    pub async fn read(&self, ctx: &OpCtx, dest: &mut [u8], start_off: i64) -> FsResult<i64> {
        if dest.is_empty() {
            return Ok(0);
        }

        let read_ctx = match ctx.deadline() {
            Some(d) if d > Instant::now() + READ_TIMEOUT_SMALLER_BY => {
                ctx.with_deadline(d - READ_TIMEOUT_SMALLER_BY)
            }
            _ => ctx.clone(),
        };

        let slices = self
            .get_byte_slices_in_range(&read_ctx, start_off, start_off + dest.len() as i64, true)
            .await?;

        let mut curr_len = 0usize;
        for b in &slices {
            dest[curr_len..curr_len + b.len()].copy_from_slice(b);
            curr_len += b.len();
        }
        Ok(curr_len as i64)
    }

    /// Returns a single buffer with the data in `[start_off, end_off)`
    /// (to EOF when `end_off` is -1).
    pub async fn get_bytes(&self, ctx: &OpCtx, start_off: i64, end_off: i64) -> FsResult<Vec<u8>> {
        let slices = self
            .get_byte_slices_in_range(ctx, start_off, end_off, false)
            .await?;
        let size = slices.iter().map(|b| b.len()).sum();
        let mut data = Vec::with_capacity(size);
        for b in slices {
            data.extend_from_slice(&b);
        }
        Ok(data)
    }

    /// Creates a new level of indirection: the current root moves
    /// under a fresh temporary id at index 0 of a new indirect block,
    /// which takes over the root pointer.
    fn create_indirect_block(
        &self,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
        dver: DataVer,
    ) -> FsResult<FileBlock> {
        let new_ptr = self.new_block_pointer(dver)?;
        let mut fblock = FileBlock::new_indirect();
        fblock.iptrs.push(IndirectFilePtr {
            info: BlockInfo {
                pointer: new_ptr,
                encoded_size: 0,
            },
            off: 0,
            holes: false,
        });

        debug!(
            "creating new level of indirection for file {}, new block id for old top level is {}",
            self.root_block_pointer(),
            new_ptr.id
        );

        // Treat the old root id as newly dirtied when it's re-cached
        // under its new pointer.
        dirty_bcache.set_not_dirty(self.root_block_pointer());
        self.cacher.cache(self.root_block_pointer(), fblock.clone())?;
        Ok(fblock)
    }

    /// Creates space for a new rightmost block pointed to at offset
    /// `off`, adding parent blocks and a new level of indirection as
    /// needed.  Returns the parent path to the new block and every
    /// newly dirtied pointer.  If `off` is smaller than the offset of
    /// the new block's left neighbor, the caller must move it into
    /// place afterwards (see `shift_blocks_to_fill_hole`).
    fn new_right_block(
        &self,
        mut parents: Vec<ParentBlockAndChildIndex>,
        off: i64,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
        dver: DataVer,
    ) -> FsResult<(Vec<ParentBlockAndChildIndex>, Vec<BlockPointer>)> {
        let max_ptrs = self.bsplit.max_ptrs_per_block();
        // Find the lowest block that can fit a new right child.
        let mut lowest_ancestor_with_room = parents
            .iter()
            .rposition(|pb| pb.pblock.iptrs.len() < max_ptrs);

        let mut new_dirty_ptrs: Vec<BlockPointer> = Vec::new();
        if lowest_ancestor_with_room.is_none() {
            let new_top_block = self.create_indirect_block(dirty_bcache, dver)?;

            // The old top block needs to be reachable under its new id
            // if it was indirect.
            if let Some(first) = parents.first() {
                let ptr = new_top_block.iptrs[0].info.pointer;
                self.cacher.cache(ptr, first.pblock.clone())?;
                new_dirty_ptrs.push(ptr);
            }

            parents.insert(
                0,
                ParentBlockAndChildIndex {
                    pblock: new_top_block,
                    child_index: 0,
                },
            );
            lowest_ancestor_with_room = Some(0);
        }
        let lowest_ancestor_with_room = lowest_ancestor_with_room.unwrap_or(0);

        debug!(
            "making new right block at off {} for file {}, lowest ancestor at level {}",
            off,
            self.root_block_pointer(),
            lowest_ancestor_with_room
        );

        let n_levels = parents.len();
        let mut right_parents: Vec<ParentBlockAndChildIndex> =
            vec![ParentBlockAndChildIndex::default(); n_levels];

        // Make a new right block for every level, starting at the
        // lowest ancestor with room.
        let mut pblock = parents[lowest_ancestor_with_room].pblock.clone();
        let mut pblock_ptr: Option<BlockPointer> = None;
        for i in lowest_ancestor_with_room..n_levels {
            let new_ptr = self.new_block_pointer(dver)?;

            debug!(
                "new right block for file {}, level {}, ptr {}",
                self.root_block_pointer(),
                i,
                new_ptr
            );

            pblock.iptrs.push(IndirectFilePtr {
                info: BlockInfo {
                    pointer: new_ptr,
                    encoded_size: 0,
                },
                off,
                holes: false,
            });
            right_parents[i] = ParentBlockAndChildIndex {
                pblock: pblock.clone(),
                child_index: pblock.iptrs.len() - 1,
            };
            match pblock_ptr {
                // A fresh intermediate block picked up its child; keep
                // the cached copy current.
                Some(pp) => self.cacher.cache(pp, pblock.clone())?,
                // The append landed in the lowest ancestor itself; it
                // gets cached in the ancestor walk below.
                None => parents[lowest_ancestor_with_room].pblock = pblock.clone(),
            }

            let rblock = if i != n_levels - 1 {
                FileBlock::new_indirect()
            } else {
                FileBlock::new_direct()
            };
            self.cacher.cache(new_ptr, rblock.clone())?;
            new_dirty_ptrs.push(new_ptr);

            pblock = rblock;
            pblock_ptr = Some(new_ptr);
        }

        // All ancestors up to and including the lowest one with room
        // changed, so mark them dirty.
        let mut ptr = self.root_block_pointer();
        for (i, pb) in parents
            .iter()
            .enumerate()
            .take(lowest_ancestor_with_room + 1)
        {
            self.cacher.cache(ptr, pb.pblock.clone())?;
            new_dirty_ptrs.push(ptr);
            ptr = pb.child_iptr().info.pointer;
            right_parents[i] = ParentBlockAndChildIndex {
                pblock: pb.pblock.clone(),
                child_index: pb.pblock.iptrs.len() - 1,
            };
        }

        Ok((right_parents, new_dirty_ptrs))
    }

    /// After `new_right_block` placed a hole-filling block at the far
    /// right of its subtree, swap it leftward one position at a time
    /// until its left neighbor has a smaller offset.  Swaps within one
    /// parent are pure pointer exchanges; swaps across cousin parents
    /// also fix up offsets along the right spine.
    async fn shift_blocks_to_fill_hole(
        &self,
        ctx: &OpCtx,
        mut parents: Vec<ParentBlockAndChildIndex>,
    ) -> FsResult<Vec<BlockPointer>> {
        let mut new_dirty_ptrs: Vec<BlockPointer> = Vec::new();

        // At least one level of indirection is guaranteed, since
        // `new_right_block` ran first.
        let mut immed_parent = parents[parents.len() - 1].clone();
        let mut curr_index = immed_parent.child_index;
        let new_block_start_off = immed_parent.child_iptr().off;

        debug!(
            "shifting block with offset {} for file {} into position",
            new_block_start_off,
            self.root_block_pointer()
        );

        loop {
            let mut left_off = 0i64;
            let mut new_parents: Vec<ParentBlockAndChildIndex> = Vec::new();
            if curr_index > 0 {
                left_off = immed_parent.pblock.iptrs[curr_index - 1].off;
            } else {
                // Look for the next left cousin: walk up to the first
                // ancestor with a left sibling, step left, then walk
                // back down along that subtree's right edge.
                new_parents = parents.clone();
                let mut level = new_parents.len() as i64 - 2;
                while level >= 0 {
                    if new_parents[level as usize].child_index > 0 {
                        break;
                    }
                    level -= 1;
                }
                if level < 0 {
                    // Already all the way on the left; done.
                    return Ok(new_dirty_ptrs);
                }
                let mut level = level as usize;
                new_parents[level].child_index -= 1;

                while level < new_parents.len() - 1 {
                    let next_child_ptr = new_parents[level].child_iptr();
                    let (child_block, _) = self
                        .getter
                        .get_file_block(
                            ctx,
                            next_child_ptr.info.pointer,
                            &self.file,
                            BlockReqType::Write,
                        )
                        .await?;
                    left_off = child_block.iptrs[child_block.iptrs.len() - 1].off;
                    new_parents[level + 1] = ParentBlockAndChildIndex {
                        child_index: child_block.iptrs.len() - 1,
                        pblock: child_block,
                    };
                    level += 1;
                }
            }

            // In position once the left neighbor starts lower.
            if left_off < new_block_start_off {
                return Ok(new_dirty_ptrs);
            }

            if curr_index > 0 {
                immed_parent.pblock.iptrs.swap(curr_index - 1, curr_index);
                curr_index -= 1;
                // Write the exchange through so later fetches see it.
                let immed_ptr = if parents.len() >= 2 {
                    parents[parents.len() - 2].child_iptr().info.pointer
                } else {
                    self.root_block_pointer()
                };
                self.cacher.cache(immed_ptr, immed_parent.pblock.clone())?;
                let last = parents.len() - 1;
                parents[last].pblock = immed_parent.pblock.clone();
                continue;
            }

            // Swap block pointers across cousins at the lowest level
            // of indirection.
            let mut new_immed_parent = new_parents[new_parents.len() - 1].clone();
            let new_curr_index = new_immed_parent.pblock.iptrs.len() - 1;
            std::mem::swap(
                &mut new_immed_parent.pblock.iptrs[new_curr_index],
                &mut immed_parent.pblock.iptrs[curr_index],
            );

            // Cache the new immediate parent as dirty.
            if new_parents.len() > 1 {
                let iptr = new_parents[new_parents.len() - 2].child_iptr();
                self.cacher
                    .cache(iptr.info.pointer, new_immed_parent.pblock.clone())?;
                new_dirty_ptrs.push(iptr.info.pointer);
            }
            let last = new_parents.len() - 1;
            new_parents[last].pblock = new_immed_parent.pblock.clone();

            // Update the offsets on the right side, up to the common
            // ancestor; the left side's incoming pointer offsets are
            // unaffected.
            let last = parents.len() - 1;
            parents[last].pblock = immed_parent.pblock.clone();
            let new_right_off = immed_parent.pblock.iptrs[curr_index].off;
            for level in (0..parents.len() - 1).rev() {
                // The block below this level just changed.
                let child_ptr = parents[level].child_iptr();
                self.cacher
                    .cache(child_ptr.info.pointer, parents[level + 1].pblock.clone())?;
                new_dirty_ptrs.push(child_ptr.info.pointer);

                // Stop at the first level where the changed child
                // isn't the leftmost.
                if parents[level + 1].child_index > 0 {
                    break;
                }
                let index = parents[level].child_index;
                parents[level].pblock.iptrs[index].off = new_right_off;
                let parent_ptr = if level == 0 {
                    self.root_block_pointer()
                } else {
                    parents[level - 1].child_iptr().info.pointer
                };
                self.cacher.cache(parent_ptr, parents[level].pblock.clone())?;
            }
            immed_parent = new_immed_parent;
            curr_index = new_curr_index;
            parents = new_parents;
        }
    }

    /// Caches every block in `parents` as dirty, zeroing the encoded
    /// size of each traversed child pointer and collecting the prior
    /// non-zero infos as unrefs for later garbage collection.
    fn mark_parents_dirty(
        &self,
        parents: &mut [ParentBlockAndChildIndex],
    ) -> FsResult<(Vec<BlockPointer>, Vec<BlockInfo>)> {
        let mut dirty_ptrs = Vec::new();
        let mut unrefs = Vec::new();
        let mut parent_ptr = self.root_block_pointer();
        for pb in parents.iter_mut() {
            if pb.child_iptr().info.encoded_size != 0 {
                unrefs.push(pb.child_iptr().info);
                pb.pblock.iptrs[pb.child_index].info.encoded_size = 0;
            }
            self.cacher.cache(parent_ptr, pb.pblock.clone())?;
            dirty_ptrs.push(parent_ptr);
            parent_ptr = pb.child_iptr().info.pointer;
        }
        Ok((dirty_ptrs, unrefs))
    }

    /// Writes `data` at `off`, making new blocks and new levels of
    /// indirection as needed.
    pub async fn write(
        &self,
        ctx: &OpCtx,
        data: &[u8],
        off: i64,
        top_block: FileBlock,
        old_de: DirEntry,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
    ) -> FsResult<WriteResult> {
        let n = data.len() as i64;
        let mut n_copied = 0i64;
        let orig_size = old_de.size;
        let mut old_size_without_holes = old_de.size;
        let mut new_de = old_de;
        let mut top_block = top_block;

        debug!("writing {} bytes at off {}", n, off);

        let mut dirty_map: HashSet<BlockPointer> = HashSet::new();
        let mut unrefs: Vec<BlockInfo> = Vec::new();
        let mut newly_dirtied_child_bytes = 0i64;
        let mut first_iteration = true;
        while n_copied < n {
            if !first_iteration {
                // Earlier iterations re-cached ancestors; traverse the
                // current copies.
                top_block = self.get_top_block(ctx, BlockReqType::Write).await?;
            }
            first_iteration = false;

            let mut at = self
                .get_block_at_offset(ctx, &top_block, off + n_copied, BlockReqType::Write)
                .await?;

            let old_len = at.block.contents.len();

            // Don't write past the beginning of the next block.
            let mut max = data.len();
            if at.next_block_start_off > 0 {
                let room = (at.next_block_start_off - off) as usize;
                if room < max {
                    max = room;
                }
            }
            let old_n_copied = n_copied;
            n_copied += self.bsplit.copy_until_split(
                &mut at.block,
                at.next_block_start_off < 0,
                &data[n_copied as usize..max],
                off + n_copied - at.start_off,
            );

            // If we need another block but there are no more, make one.
            let mut switch_to_indirect = false;
            let mut ptr = at.ptr;
            if n_copied < n {
                let need_extend_file = at.next_block_start_off < 0;
                let need_fill_hole = off + n_copied < at.next_block_start_off;
                let mut new_block_off = at.start_off + at.block.contents.len() as i64;
                if n_copied == 0 {
                    if new_block_off < off {
                        // Writing inside a hole, past the end of the
                        // existing block; the next block starts right
                        // at the offset we care about.
                        new_block_off = off;
                    }
                } else if new_block_off != off + n_copied {
                    return Err(FsError::InconsistentByteCount {
                        expected: (new_block_off - off).max(0) as usize,
                        actual: n_copied as usize,
                    });
                }
                if need_extend_file || need_fill_hole {
                    debug!(
                        "making new right block at n_copied={}, new_block_off={}",
                        n_copied, new_block_off
                    );
                    let was_indirect = top_block.is_ind;
                    let (right_parents, new_dirty_ptrs) = self.new_right_block(
                        at.parents.clone(),
                        new_block_off,
                        dirty_bcache,
                        default_new_block_data_version(false),
                    )?;
                    top_block = right_parents[0].pblock.clone();
                    dirty_map.extend(new_dirty_ptrs);
                    if top_block.is_ind != was_indirect {
                        // The old direct data needs to be re-uploaded
                        // as a child block under a new pointer, so its
                        // dirty bytes get re-counted below.
                        switch_to_indirect = true;
                        ptr = top_block.iptrs[0].info.pointer;
                        self.cacher.cache(ptr, at.block.clone())?;
                        dirty_map.insert(ptr);
                    }
                    // When filling a hole, swap the new block into
                    // place and shift everything else over.
                    if need_fill_hole {
                        let new_dirty_ptrs =
                            self.shift_blocks_to_fill_hole(ctx, right_parents).await?;
                        dirty_map.extend(new_dirty_ptrs);
                        if old_size_without_holes == orig_size {
                            // Disregard the pre-existing hole when
                            // counting the newly dirtied bytes.
                            old_size_without_holes = new_block_off as u64;
                        }
                        top_block = self.get_top_block(ctx, BlockReqType::Write).await?;
                    }
                }
            }

            // Nothing got copied and no new pointer was minted; the
            // last block was already full.
            if n_copied == old_n_copied && !switch_to_indirect {
                // A zero-fill growth of an already-dirty block still
                // has to stick, even with no payload bytes landed.
                if at.was_dirty && at.block.contents.len() != old_len {
                    self.cacher.cache(ptr, at.block.clone())?;
                }
                continue;
            }

            // Only the last block grows the file.
            if old_len != at.block.contents.len() && at.next_block_start_off < 0 {
                new_de.info.encoded_size = 0;
                new_de.size += (at.block.contents.len() - old_len) as u64;
            }

            newly_dirtied_child_bytes += at.block.contents.len() as i64;
            if at.was_dirty {
                newly_dirtied_child_bytes -= old_len as i64;
            }

            // Keep the old block id while it's dirty.
            self.cacher.cache(ptr, at.block.clone())?;
            dirty_map.insert(ptr);

            // The tree may have been restructured above; walk a fresh
            // path for the dirty marking.
            let mut fresh = self
                .get_block_at_offset(ctx, &top_block, at.start_off, BlockReqType::Write)
                .await?;
            let (new_dirty_ptrs, new_unrefs) = self.mark_parents_dirty(&mut fresh.parents)?;
            unrefs.extend(new_unrefs);
            dirty_map.extend(new_dirty_ptrs);
        }

        if top_block.is_ind {
            // Always re-dirty the top block, so the sync path revisits
            // the indirect blocks and concurrent writes during a sync
            // get deferred.
            let top = self.get_top_block(ctx, BlockReqType::Write).await?;
            self.cacher.cache(self.root_block_pointer(), top)?;
            dirty_map.insert(self.root_block_pointer());
        }

        let last_byte_written = off + data.len() as i64; // not counting holes
        let mut bytes_extended = 0i64;
        if last_byte_written > old_size_without_holes as i64 {
            bytes_extended = last_byte_written - old_size_without_holes as i64;
        }

        Ok(WriteResult {
            new_de,
            dirty_ptrs: dirty_map.into_iter().collect(),
            unrefs,
            newly_dirtied_child_bytes,
            bytes_extended,
        })
    }

    /// Extends the file to `size` by appending a hole.  `parents` is
    /// the parent path from locating the old rightmost block.
    pub async fn truncate_extend(
        &self,
        ctx: &OpCtx,
        size: u64,
        top_block: FileBlock,
        parents: Vec<ParentBlockAndChildIndex>,
        old_de: DirEntry,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
    ) -> FsResult<(DirEntry, Vec<BlockPointer>)> {
        ctx.check()?;
        debug!(
            "truncate_extend: extending file {} to size {}",
            self.root_block_pointer(),
            size
        );
        let switch_to_indirect = !top_block.is_ind;
        let old_top_block = top_block;
        if switch_to_indirect {
            debug!(
                "truncate_extend: making block indirect {}",
                self.root_block_pointer()
            );
        }

        let mut dirty_ptrs: Vec<BlockPointer> = Vec::new();
        let (right_parents, new_dirty_ptrs) = self.new_right_block(
            parents,
            size as i64,
            dirty_bcache,
            default_new_block_data_version(true),
        )?;
        let mut top_block = right_parents[0].pblock.clone();

        if switch_to_indirect {
            top_block.iptrs[0].holes = true;
            self.cacher
                .cache(top_block.iptrs[0].info.pointer, old_top_block)?;
            dirty_ptrs.push(top_block.iptrs[0].info.pointer);
            debug!(
                "truncate_extend: new zero data block {}",
                top_block.iptrs[0].info.pointer
            );
        }
        dirty_ptrs.extend(new_dirty_ptrs);
        let mut new_de = old_de;
        new_de.info.encoded_size = 0;
        new_de.size = size;

        // Mark every top-level pointer for the presence of holes; one
        // would be enough, but this is more robust.
        for iptr in top_block.iptrs.iter_mut() {
            iptr.holes = true;
        }
        // Always re-dirty the top block, so the sync path revisits the
        // indirect blocks and concurrent writes during a sync get
        // deferred.
        self.cacher.cache(self.root_block_pointer(), top_block)?;
        dirty_ptrs.push(self.root_block_pointer());
        Ok((new_de, dirty_ptrs))
    }

    /// Shrinks the file to `size`, unreferencing every block past the
    /// new rightmost leaf.  Single-child indirection spines left over
    /// from the shrink are kept as-is.
    pub async fn truncate_shrink(
        &self,
        ctx: &OpCtx,
        size: u64,
        top_block: FileBlock,
        old_de: DirEntry,
    ) -> FsResult<TruncateResult> {
        let i_size = size as i64;

        let mut at = self
            .get_block_at_offset(ctx, &top_block, i_size, BlockReqType::Write)
            .await?;

        let old_len = at.block.contents.len();
        // Copy into a fresh buffer so the truncated bytes can be
        // collected.
        at.block.contents = at.block.contents[..(i_size - at.start_off) as usize].to_vec();

        let mut newly_dirtied_child_bytes = at.block.contents.len() as i64;
        if at.was_dirty {
            newly_dirtied_child_bytes -= old_len as i64; // negative
        }

        // Keep the old block id while it's dirty.
        self.cacher.cache(at.ptr, at.block.clone())?;

        // Mark the parents dirty before walking the right side, so the
        // walk sees the new copies.
        let (new_dirty_ptrs, mut unrefs) = self.mark_parents_dirty(&mut at.parents)?;
        let mut dirty_map: HashSet<BlockPointer> = new_dirty_ptrs.into_iter().collect();
        dirty_map.insert(at.ptr);

        if at.next_block_start_off > 0 {
            // Walk every path to the leaves past the new rightmost
            // block; those blocks get unreferenced and their parents
            // modified or unreferenced.
            let walk_top = self.get_top_block(ctx, BlockReqType::Read).await?;
            let pfr = self
                .get_indirect_blocks_for_range(ctx, &walk_top, at.next_block_start_off, -1)
                .await?;

            // Each indirect block's original child pointers, saved
            // before truncation so the remaining paths can still be
            // walked; doubles as a processed-set.
            let mut saved_child_ptrs: HashMap<BlockPointer, Vec<IndirectFilePtr>> = HashMap::new();
            for path in &pfr {
                let mut parent_info = BlockInfo {
                    pointer: self.root_block_pointer(),
                    encoded_size: 0,
                };
                let mut left_most = true;
                for (i, pb) in path.iter().enumerate() {
                    let ptrs = match saved_child_ptrs.get(&parent_info.pointer) {
                        Some(ptrs) => ptrs.clone(),
                        None => {
                            // Process each block exactly once.
                            let ptrs = pb.pblock.iptrs.clone();
                            saved_child_ptrs.insert(parent_info.pointer, ptrs.clone());

                            // Cut at this child, or one past it if all
                            // the child indices below are 0.
                            let mut remove_starting_from_index = pb.child_index;
                            for later in path.iter().skip(i + 1) {
                                if later.child_index > 0 {
                                    remove_starting_from_index += 1;
                                    break;
                                }
                            }

                            if pb.child_index == 0 && !left_most {
                                // Dropping child 0 drops the whole
                                // block, unless it's on the leftmost
                                // spine, which stays for now.
                                if parent_info.encoded_size != 0 {
                                    unrefs.push(parent_info);
                                }
                            } else if remove_starting_from_index < pb.pblock.iptrs.len() {
                                // Re-fetch for writing in case a dirty
                                // copy already exists.
                                let (mut wblock, _) = self
                                    .getter
                                    .get_file_block(
                                        ctx,
                                        parent_info.pointer,
                                        &self.file,
                                        BlockReqType::Write,
                                    )
                                    .await?;
                                wblock.iptrs.truncate(remove_starting_from_index);
                                self.cacher.cache(parent_info.pointer, wblock)?;
                                dirty_map.insert(parent_info.pointer);
                            }
                            ptrs
                        }
                    };

                    // Down a level; leaves get unreferenced here.
                    parent_info = ptrs[pb.child_index].info;
                    if i == path.len() - 1 && parent_info.encoded_size != 0 {
                        unrefs.push(parent_info);
                    } else if pb.child_index > 0 {
                        left_most = false;
                    }
                }
            }
        }

        if top_block.is_ind {
            // Always re-dirty the top block, so the sync path revisits
            // the indirect blocks and concurrent truncates during a
            // sync get deferred.
            let top = self.get_top_block(ctx, BlockReqType::Write).await?;
            self.cacher.cache(self.root_block_pointer(), top)?;
            dirty_map.insert(self.root_block_pointer());
        }

        let mut new_de = old_de;
        new_de.info.encoded_size = 0;
        new_de.size = size;

        Ok(TruncateResult {
            new_de,
            dirty_ptrs: dirty_map.into_iter().collect(),
            unrefs,
            newly_dirtied_child_bytes,
        })
    }

    /// Checks whether any dirty leaf needs to be split differently
    /// (for fingerprinting-based boundaries): oversized leaves push
    /// their tail into the next block, undersized leaves pull bytes
    /// from it.  Returns the blocks that now need unreferencing.
    pub async fn split(
        &self,
        ctx: &OpCtx,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
        top_block: &FileBlock,
    ) -> FsResult<Vec<BlockInfo>> {
        if !top_block.is_ind {
            return Ok(Vec::new());
        }

        let mut unrefs: Vec<BlockInfo> = Vec::new();
        let mut off = 0i64;
        while off >= 0 {
            let top_block = self.get_top_block(ctx, BlockReqType::Write).await?;
            let Some(mut at) = self
                .get_next_dirty_block_at_offset(
                    ctx,
                    &top_block,
                    off,
                    BlockReqType::Write,
                    dirty_bcache,
                )
                .await?
            else {
                // No more dirty blocks.
                break;
            };
            off = at.next_block_start_off; // -1 when no more blocks

            let split_at = self.bsplit.check_split(&at.block);
            if split_at == 0 {
                continue;
            } else if split_at > 0 {
                let split_at = split_at as usize;
                let end_of_block = at.start_off + at.block.contents.len() as i64;
                let extra_bytes = at.block.contents[split_at..].to_vec();
                at.block.contents.truncate(split_at);
                self.cacher.cache(at.ptr, at.block.clone())?;

                // The extra bytes go in front of the next block.
                if at.next_block_start_off < 0 {
                    self.new_right_block(
                        at.parents.clone(),
                        end_of_block,
                        dirty_bcache,
                        default_new_block_data_version(false),
                    )?;
                }
                let walk_top = self.get_top_block(ctx, BlockReqType::Write).await?;
                let mut right = self
                    .get_block_at_offset(ctx, &walk_top, end_of_block, BlockReqType::Write)
                    .await?;
                let mut new_contents = extra_bytes;
                new_contents.extend_from_slice(&right.block.contents);
                right.block.contents = new_contents;
                self.cacher.cache(right.ptr, right.block.clone())?;
                let end_of_block = at.start_off + at.block.contents.len() as i64;

                // The old right block needs unreferencing.
                let last = right.parents.len() - 1;
                unrefs.push(right.parents[last].child_iptr().info);
                let idx = right.parents[last].child_index;
                right.parents[last].pblock.iptrs[idx].info.encoded_size = 0;

                // Update parent offsets along the right block's left
                // spine.
                for level in (0..right.parents.len()).rev() {
                    let idx = right.parents[level].child_index;
                    right.parents[level].pblock.iptrs[idx].off = end_of_block;
                    if idx > 0 {
                        break;
                    }
                }

                let (_, new_unrefs) = self.mark_parents_dirty(&mut right.parents)?;
                unrefs.extend(new_unrefs);
                off = end_of_block;
            } else {
                // The block wants more bytes.
                if at.next_block_start_off < 0 {
                    // End of the line.
                    continue;
                }

                let end_of_block = at.start_off + at.block.contents.len() as i64;
                let walk_top = self.get_top_block(ctx, BlockReqType::Write).await?;
                let mut right = self
                    .get_block_at_offset(ctx, &walk_top, end_of_block, BlockReqType::Write)
                    .await?;
                // Pull some of the right block's bytes into this one.
                let at_block_len = at.block.contents.len() as i64;
                let n_copied = self.bsplit.copy_until_split(
                    &mut at.block,
                    false,
                    &right.block.contents,
                    at_block_len,
                );
                right.block.contents.drain(..n_copied as usize);
                let end_of_block = at.start_off + at.block.contents.len() as i64;
                self.cacher.cache(at.ptr, at.block.clone())?;

                // The old right block needs unreferencing.
                let last = right.parents.len() - 1;
                unrefs.push(right.parents[last].child_iptr().info);
                let idx = right.parents[last].child_index;
                right.parents[last].pblock.iptrs[idx].info.encoded_size = 0;

                if !right.block.contents.is_empty() {
                    self.cacher.cache(right.ptr, right.block.clone())?;

                    // Update parent offsets along the right block's
                    // left spine.
                    for level in (0..right.parents.len()).rev() {
                        let idx = right.parents[level].child_index;
                        right.parents[level].pblock.iptrs[idx].off = end_of_block;
                        if idx > 0 {
                            break;
                        }
                    }

                    let (_, new_unrefs) = self.mark_parents_dirty(&mut right.parents)?;
                    unrefs.extend(new_unrefs);
                } else {
                    // The right block is empty now; drop its entry and
                    // cache the shortened parent, then dirty only the
                    // remaining ancestors.
                    let idx = right.parents[last].child_index;
                    right.parents[last].pblock.iptrs.remove(idx);
                    let parent_ptr = if right.parents.len() >= 2 {
                        right.parents[last - 1].child_iptr().info.pointer
                    } else {
                        self.root_block_pointer()
                    };
                    self.cacher
                        .cache(parent_ptr, right.parents[last].pblock.clone())?;
                    let (_, new_unrefs) = self.mark_parents_dirty(&mut right.parents[..last])?;
                    unrefs.extend(new_unrefs);
                }
                off = end_of_block;
            }
        }
        Ok(unrefs)
    }

    /// Readies all dirty child blocks bottom-up (excluding the root,
    /// which the folder-branch sync handles), updating parent pointer
    /// slots with the fresh permanent infos.  Returns a map from each
    /// produced info back to its prior pointer so the caller can
    /// sequence the id renames.
    pub async fn ready(
        &self,
        ctx: &OpCtx,
        dirty_bcache: &Arc<dyn DirtyBlockCache>,
        top_block: &FileBlock,
        readier: &dyn BlockReadier,
    ) -> FsResult<HashMap<BlockInfo, BlockPointer>> {
        if !top_block.is_ind {
            return Ok(HashMap::new());
        }

        // Gather the paths to all dirty leaves, and a working set of
        // the blocks along them keyed by pointer, so sibling paths
        // sharing a parent observe each other's slot updates.
        let mut leaf_paths: Vec<Vec<(BlockPointer, usize)>> = Vec::new();
        let mut working: HashMap<BlockPointer, FileBlock> = HashMap::new();
        let mut off = 0i64;
        while off >= 0 {
            let Some(at) = self
                .get_next_dirty_block_at_offset(
                    ctx,
                    top_block,
                    off,
                    BlockReqType::Write,
                    dirty_bcache,
                )
                .await?
            else {
                break;
            };
            off = at.next_block_start_off;

            let mut ptr_path = Vec::with_capacity(at.parents.len());
            let mut curr_ptr = self.root_block_pointer();
            for pb in &at.parents {
                working.entry(curr_ptr).or_insert_with(|| pb.pblock.clone());
                ptr_path.push((curr_ptr, pb.child_index));
                curr_ptr = pb.child_iptr().info.pointer;
            }
            working.entry(curr_ptr).or_insert_with(|| at.block.clone());
            leaf_paths.push(ptr_path);
        }

        // No dirty blocks means nothing to do.
        if leaf_paths.is_empty() {
            return Ok(HashMap::new());
        }

        let mut old_ptrs: HashMap<BlockInfo, BlockPointer> = HashMap::new();
        let depth = leaf_paths[0].len();

        // From the leaf level up, ready each distinct dirty block once
        // and put the new info into the parent's slot.
        for level in (1..=depth).rev() {
            let mut new_ptrs: HashSet<BlockPointer> = HashSet::new();
            for path in &leaf_paths {
                let (parent_ptr, child_index) = path[level - 1];
                let parent = working
                    .get(&parent_ptr)
                    .ok_or(FsError::NoSuchBlock(parent_ptr.id))?;
                let child_ptr = parent.iptrs[child_index].info.pointer;
                // Already replaced via a sibling path.
                if new_ptrs.contains(&child_ptr) {
                    continue;
                }

                let block = working
                    .get(&child_ptr)
                    .cloned()
                    .ok_or(FsError::NoSuchBlock(child_ptr.id))?;
                let new_info = readier.ready_block(ctx, &block).await?;

                // Only the leaf level clears the dirty state once the
                // put completes.
                let on_sync: Option<SyncHook> = if level == depth {
                    let db = Arc::clone(dirty_bcache);
                    Some(Box::new(move || db.set_synced(child_ptr)))
                } else {
                    None
                };
                readier.queue_block_put(new_info, block.clone(), on_sync)?;
                new_ptrs.insert(new_info.pointer);

                let parent = working
                    .get_mut(&parent_ptr)
                    .ok_or(FsError::NoSuchBlock(parent_ptr.id))?;
                parent.iptrs[child_index].info = new_info;
                working.insert(new_info.pointer, block);
                old_ptrs.insert(new_info, child_ptr);
            }
        }
        Ok(old_ptrs)
    }

    pub async fn get_indirect_file_block_infos(&self, ctx: &OpCtx) -> FsResult<Vec<BlockInfo>> {
        let top_block = self.get_top_block(ctx, BlockReqType::Read).await?;
        self.get_indirect_file_block_infos_with_top_block(&top_block)
    }

    pub fn get_indirect_file_block_infos_with_top_block(
        &self,
        top_block: &FileBlock,
    ) -> FsResult<Vec<BlockInfo>> {
        if !top_block.is_ind {
            return Ok(Vec::new());
        }
        Ok(top_block.iptrs.iter().map(|iptr| iptr.info).collect())
    }

    /// Looks for the given pointer among the top block's children and
    /// clears its encoded size, reporting whether it was found.
    pub fn find_iptr_and_clear_size(&self, top_block: &mut FileBlock, ptr: BlockPointer) -> bool {
        for iptr in top_block.iptrs.iter_mut() {
            if iptr.info.pointer == ptr {
                iptr.info.encoded_size = 0;
                return true;
            }
        }
        false
    }

    /// Makes a complete copy of this file, deduping leaf blocks by
    /// minting fresh ref nonces and giving the indirect root a new
    /// temporary id.  Handles one level of indirection.
    pub async fn deep_copy(
        &self,
        ctx: &OpCtx,
        dver: DataVer,
    ) -> FsResult<(BlockPointer, Vec<BlockPointer>)> {
        let top_block = self.get_top_block(ctx, BlockReqType::Read).await?;

        let mut new_top_block = top_block.clone();
        let mut new_top_ptr = self.root_block_pointer();
        if top_block.is_ind {
            new_top_ptr = self.new_block_pointer(dver)?;
        } else {
            new_top_ptr.context.ref_nonce = self.crypto.make_block_ref_nonce()?;
            new_top_ptr.set_writer(self.uid);
        }
        debug!(
            "deep copying file {}: {} -> {}",
            self.file.tail_name(),
            self.root_block_pointer(),
            new_top_ptr
        );

        // Dup the leaf blocks with a fresh nonce each.
        let mut all_child_ptrs = Vec::new();
        if top_block.is_ind {
            for (i, iptr) in top_block.iptrs.iter().enumerate() {
                let mut iptr = *iptr;
                iptr.info.pointer.context.ref_nonce = self.crypto.make_block_ref_nonce()?;
                iptr.info.pointer.set_writer(self.uid);
                new_top_block.iptrs[i] = iptr;
                all_child_ptrs.push(iptr.info.pointer);
            }
        }

        self.cacher.cache(new_top_ptr, new_top_block)?;
        Ok((new_top_ptr, all_child_ptrs))
    }

    /// Un-deduplicates the leaf children of a block copied with
    /// `deep_copy`, readying and queueing each one.  Returns the
    /// resulting child infos.  Handles one level of indirection.
    pub async fn undup_children_in_copy(
        &self,
        ctx: &OpCtx,
        readier: &dyn BlockReadier,
        top_block: &mut FileBlock,
    ) -> FsResult<Vec<BlockInfo>> {
        if !top_block.is_ind {
            return Ok(Vec::new());
        }

        let mut block_infos = Vec::with_capacity(top_block.iptrs.len());
        for i in 0..top_block.iptrs.len() {
            let iptr = top_block.iptrs[i];
            if iptr.info.pointer.context.ref_nonce == block_lib::ZERO_REF_NONCE {
                // Not a deduplicated reference.
                block_infos.push(iptr.info);
                continue;
            }
            let (child_block, _) = self
                .getter
                .get_file_block(ctx, iptr.info.pointer, &self.file, BlockReqType::Read)
                .await?;

            let new_info = readier.ready_block(ctx, &child_block).await?;
            readier.queue_block_put(new_info, child_block, None)?;
            top_block.iptrs[i].info = new_info;
            block_infos.push(new_info);
        }
        Ok(block_infos)
    }
}
