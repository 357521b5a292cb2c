use crate::{BlockUpdate, CrAction, CrChains, Op, OpVariant, RootMetadata};
use async_trait::async_trait;
use block_lib::{
    zero_ptr, BlockPointer, EntryType, FolderBranch, FsError, FsResult, Kbpki, MetadataRevision,
    OpCtx, Path, PathNode, REVISION_UNINITIALIZED,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Fetches the metadata revision lists a resolution works from.
#[async_trait]
pub trait MdOps: Send + Sync {
    /// All outstanding unmerged revisions for this device, plus the
    /// branch point they forked from.
    async fn get_unmerged_md_updates(
        &self,
        ctx: &OpCtx,
    ) -> FsResult<(MetadataRevision, Vec<RootMetadata>)>;

    /// The merged revisions starting at `start`.
    async fn get_merged_md_updates(
        &self,
        ctx: &OpCtx,
        start: MetadataRevision,
    ) -> FsResult<Vec<RootMetadata>>;

    /// Re-embeds block-change ops that were stored out of line.
    async fn reembed_block_changes(&self, ctx: &OpCtx, mds: &mut [RootMetadata]) -> FsResult<()>;
}

/// Finds the full rooted path for block pointers within a given
/// revision's tree, treating `new_ptrs` as the pointers updated in the
/// branch window.  A pointer that cannot be reached maps to None.
#[async_trait]
pub trait NodeSearcher: Send + Sync {
    async fn search_for_paths(
        &self,
        ctx: &OpCtx,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &RootMetadata,
    ) -> FsResult<HashMap<BlockPointer, Option<Path>>>;
}

/// Mints the loser-tagged name when both branches claimed the same
/// entry name.  Must be a deterministic function of the losing op.
pub trait ConflictRenamer: Send + Sync {
    fn conflict_rename(&self, op: &Op, original: &str) -> String;
}

/// Default renamer: `<name>.conflict.<writer>.<timestamp>`.
pub struct WriterDateConflictRenamer;

impl ConflictRenamer for WriterDateConflictRenamer {
    fn conflict_rename(&self, op: &Op, original: &str) -> String {
        format!(
            "{}.conflict.{}.{}",
            original, op.common.writer_name, op.common.timestamp
        )
    }
}

/// Per-merged-tail-pointer action lists produced by a resolution.
pub type ResolutionActions = HashMap<BlockPointer, Vec<CrAction>>;

/// The pair of terminal revisions a resolution was asked to reconcile.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConflictInput {
    pub unmerged: MetadataRevision,
    pub merged: MetadataRevision,
}

impl ConflictInput {
    fn uninitialized() -> Self {
        Self {
            unmerged: REVISION_UNINITIALIZED,
            merged: REVISION_UNINITIALIZED,
        }
    }
}

/// Everything a finished resolution hands back to the folder-branch
/// layer for application.
#[derive(Clone, Default)]
pub struct ResolutionResult {
    pub unmerged_paths: Vec<Path>,
    /// Most recent unmerged tail pointer -> full merged path.
    pub merged_paths: HashMap<BlockPointer, Path>,
    pub recreate_ops: Vec<Op>,
    /// Merged path tail pointer -> actions to apply there.
    pub actions: ResolutionActions,
    pub unmerged_chains: CrChains,
    pub merged_chains: CrChains,
}

struct ResolverShared {
    folder_branch: FolderBranch,
    md_ops: Arc<dyn MdOps>,
    searcher: Arc<dyn NodeSearcher>,
    kbpki: Arc<dyn Kbpki>,
    renamer: Arc<dyn ConflictRenamer>,

    curr_input: Mutex<ConflictInput>,
    current_cancel: Mutex<Option<CancellationToken>>,
    pending: Mutex<u64>,
    done: Notify,
    completed: AtomicU64,
    next_resolve_id: AtomicU64,
    last_resolution: Mutex<Option<ResolutionResult>>,
    last_error: Mutex<Option<String>>,
}

/// Background engine that reconciles a folder branch's unmerged
/// revision chain with the server's merged chain.  At most one
/// resolution runs at a time; a newer interesting input preempts the
/// running one by canceling its context.
pub struct ConflictResolver {
    shared: Arc<ResolverShared>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<ConflictInput>>>,
}

impl ConflictResolver {
    pub fn new(
        folder_branch: FolderBranch,
        md_ops: Arc<dyn MdOps>,
        searcher: Arc<dyn NodeSearcher>,
        kbpki: Arc<dyn Kbpki>,
        renamer: Arc<dyn ConflictRenamer>,
    ) -> Self {
        let shared = Arc::new(ResolverShared {
            folder_branch,
            md_ops,
            searcher,
            kbpki,
            renamer,
            curr_input: Mutex::new(ConflictInput::uninitialized()),
            current_cancel: Mutex::new(None),
            pending: Mutex::new(0),
            done: Notify::new(),
            completed: AtomicU64::new(0),
            next_resolve_id: AtomicU64::new(1),
            last_resolution: Mutex::new(None),
            last_error: Mutex::new(None),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ResolverShared::process_input(shared.clone(), rx));

        Self {
            shared,
            input_tx: Mutex::new(Some(tx)),
        }
    }

    /// Submits the latest known unmerged and merged revision numbers.
    /// Non-blocking; a no-op once the resolver is shutting down.
    pub fn resolve(&self, unmerged: MetadataRevision, merged: MetadataRevision) {
        let tx_guard = self.input_tx.lock().unwrap();
        let Some(tx) = tx_guard.as_ref() else {
            return;
        };
        {
            let mut pending = self.shared.pending.lock().unwrap();
            *pending += 1;
        }
        if tx.send(ConflictInput { unmerged, merged }).is_err() {
            self.shared.finish_one();
        }
    }

    /// Blocks until every submitted resolution has finished (whether
    /// or not it succeeded), or until the context is canceled.
    pub async fn wait(&self, ctx: &OpCtx) -> FsResult<()> {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.shared.pending.lock().unwrap() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = ctx.cancel_token().cancelled() => return Err(FsError::Canceled),
            }
        }
    }

    /// Cancels any in-flight resolution and refuses further input.
    pub fn shutdown(&self) {
        let mut tx = self.input_tx.lock().unwrap();
        tx.take();
        if let Some(cancel) = self.shared.current_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    /// The greatest (unmerged, merged) pair observed so far.
    pub fn current_input(&self) -> ConflictInput {
        *self.shared.curr_input.lock().unwrap()
    }

    pub fn last_resolution(&self) -> Option<ResolutionResult> {
        self.shared.last_resolution.lock().unwrap().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }

    /// Number of resolution attempts that reached a terminal state.
    pub fn resolutions_completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }
}

impl ResolverShared {
    fn finish_one(&self) {
        {
            let mut pending = self.pending.lock().unwrap();
            *pending = pending.saturating_sub(1);
        }
        self.done.notify_waiters();
    }

    /// Single consumer over the input channel.  An input is only
    /// interesting if one of its revisions is greater than what's been
    /// seen so far; interesting inputs cancel the running resolution
    /// and start their own.
    async fn process_input(
        shared: Arc<ResolverShared>,
        mut rx: mpsc::UnboundedReceiver<ConflictInput>,
    ) {
        while let Some(ci) = rx.recv().await {
            let interesting = {
                let mut curr = shared.curr_input.lock().unwrap();
                if ci.unmerged <= curr.unmerged && ci.merged <= curr.merged {
                    false
                } else {
                    debug!(
                        "[{}] new conflict input {:?} following old input {:?}",
                        shared.folder_branch.tlf, ci, *curr
                    );
                    *curr = ci;
                    true
                }
            };
            if !interesting {
                debug!(
                    "[{}] ignoring uninteresting input: {:?}",
                    shared.folder_branch.tlf, ci
                );
                shared.finish_one();
                continue;
            }

            let token = CancellationToken::new();
            {
                let mut current = shared.current_cancel.lock().unwrap();
                if let Some(prev) = current.replace(token.clone()) {
                    prev.cancel();
                }
            }

            let task_shared = shared.clone();
            tokio::spawn(async move {
                let ctx = OpCtx::with_cancel(token);
                task_shared.do_resolve(&ctx, ci).await;
                task_shared.finish_one();
            });
        }
    }

    async fn do_resolve(&self, ctx: &OpCtx, ci: ConflictInput) {
        let id = self.next_resolve_id.fetch_add(1, Ordering::SeqCst);
        debug!("[cr {}] starting conflict resolution with input {:?}", id, ci);
        let result = self.resolve_once(ctx, ci).await;
        match result {
            Ok(Some(res)) => {
                debug!("[cr {}] finished conflict resolution", id);
                *self.last_resolution.lock().unwrap() = Some(res);
            }
            Ok(None) => {
                debug!("[cr {}] conflict resolution had nothing to do", id);
            }
            Err(e) => {
                debug!("[cr {}] finished conflict resolution: {}", id, e);
                *self.last_error.lock().unwrap() = Some(e.to_string());
            }
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    async fn resolve_once(
        &self,
        ctx: &OpCtx,
        _ci: ConflictInput,
    ) -> FsResult<Option<ResolutionResult>> {
        // Canceled before we even got started?
        ctx.check()?;

        // Fetch the unmerged and merged revisions.
        let (unmerged, merged) = self.get_mds(ctx).await?;
        if unmerged.is_empty() || merged.is_empty() {
            debug!(
                "skipping merge process due to empty MD list: {} unmerged, {} merged",
                unmerged.len(),
                merged.len()
            );
            return Ok(None);
        }

        // Pin the current input to the revisions we'll actually work
        // with.
        self.update_curr_input(ctx, &unmerged, &merged)?;

        // Canceled before the heavy lifting?
        ctx.check()?;

        // Build the chains for both branches.
        let mut unmerged_chains = CrChains::from_revisions(&unmerged)?;
        let mut merged_chains = CrChains::from_revisions(&merged)?;

        // Full paths for every most recent unmerged pointer with ops,
        // excluding nodes created or deleted within the branch.
        let unmerged_paths = self
            .get_unmerged_paths(ctx, &mut unmerged_chains, unmerged.last().unwrap())
            .await?;

        // The corresponding merged path for each unmerged path, plus
        // the creates needed to resurrect deleted directories.
        let (mut merged_paths, recreate_ops) = self
            .resolve_merged_paths(
                ctx,
                &unmerged_paths,
                &unmerged_chains,
                &mut merged_chains,
                merged.last().unwrap(),
            )
            .await?;
        ctx.check()?;

        // Install the recreate ops into the unmerged chains.
        let recreate_ops = self
            .add_recreate_ops_to_unmerged_chains(
                ctx,
                recreate_ops,
                &mut unmerged_chains,
                &merged_chains,
                &mut merged_paths,
            )
            .await?;

        // Turn cycle-causing renames into symlink creates.
        self.fix_rename_cycles(&mut unmerged_chains, &merged_chains, &merged_paths)?;

        let actions =
            self.get_actions_to_merge(&unmerged_chains, &merged_chains, &merged_paths)?;

        Ok(Some(ResolutionResult {
            unmerged_paths,
            merged_paths,
            recreate_ops,
            actions,
            unmerged_chains,
            merged_chains,
        }))
    }

    async fn get_mds(&self, ctx: &OpCtx) -> FsResult<(Vec<RootMetadata>, Vec<RootMetadata>)> {
        // All outstanding unmerged revisions for this device first,
        // then the merged ones from just past the branch point.
        let (branch_point, mut unmerged) = self.md_ops.get_unmerged_md_updates(ctx).await?;
        let mut merged = self
            .md_ops
            .get_merged_md_updates(ctx, branch_point.next())
            .await?;

        self.md_ops.reembed_block_changes(ctx, &mut unmerged).await?;
        self.md_ops.reembed_block_changes(ctx, &mut merged).await?;

        Ok((unmerged, merged))
    }

    /// Bounds the current input to the terminal revisions actually
    /// retrieved; leaves it untouched on failure.
    fn update_curr_input(
        &self,
        ctx: &OpCtx,
        unmerged: &[RootMetadata],
        merged: &[RootMetadata],
    ) -> FsResult<()> {
        let mut curr = self.curr_input.lock().unwrap();
        // Check for cancellation under the lock, so a preempting input
        // can't be clobbered.
        ctx.check()?;

        if let Some(last) = unmerged.last() {
            if last.revision < curr.unmerged {
                return Err(FsError::Internal(format!(
                    "unmerged revision {} is lower than the expected unmerged revision {}",
                    last.revision, curr.unmerged
                )));
            }
        }
        if let Some(last) = merged.last() {
            if last.revision < curr.merged {
                return Err(FsError::Internal(format!(
                    "merged revision {} is lower than the expected merged revision {}",
                    last.revision, curr.merged
                )));
            }
        }
        if let Some(last) = unmerged.last() {
            curr.unmerged = last.revision;
        }
        if let Some(last) = merged.last() {
            curr.merged = last.revision;
        }
        Ok(())
    }

    /// Finds the full path for every most recent unmerged pointer
    /// whose chain has ops and whose node lived through the whole
    /// branch.  Chains with no discoverable path are dropped.  Paths
    /// come back deepest-first, so inner nodes are processed before
    /// their ancestors.
    async fn get_unmerged_paths(
        &self,
        ctx: &OpCtx,
        unmerged_chains: &mut CrChains,
        most_recent_md: &RootMetadata,
    ) -> FsResult<Vec<Path>> {
        let mut new_ptrs = HashSet::new();
        let mut ptrs = Vec::new();
        for (most_recent, chain) in unmerged_chains.iter_by_most_recent() {
            new_ptrs.insert(most_recent);
            if !chain.ops.is_empty()
                && !unmerged_chains.is_created(chain.original)
                && !unmerged_chains.is_deleted(chain.original)
            {
                ptrs.push(most_recent);
            }
        }

        let node_map = self
            .searcher
            .search_for_paths(ctx, &ptrs, &new_ptrs, most_recent_md)
            .await?;

        let mut paths = Vec::with_capacity(node_map.len());
        for (ptr, found) in node_map {
            let Some(p) = found else {
                debug!("ignoring pointer with no found path: {}", ptr);
                unmerged_chains.remove_chain(ptr);
                continue;
            };
            if p.tail_pointer() != ptr {
                return Err(FsError::NodeNotFound(ptr.id));
            }
            unmerged_chains.set_final_paths_by_most_recent(ptr, &p);
            paths.push(p);
        }

        // Deepest paths first.
        paths.sort_by(|a, b| b.depth().cmp(&a.depth()));
        Ok(paths)
    }

    /// Works out as much of the merged path for one unmerged path as
    /// the chains alone can say: walks the unmerged path tail-to-root
    /// emitting recreates for levels deleted on the merged side, then
    /// keeps climbing until an ancestor exists in the merged tree or
    /// was renamed elsewhere.  Returns the partial (rootless) merged
    /// path, the merged pointer to resume the search from, and the
    /// recreate ops (outermost first).
    async fn resolve_merged_path_tail(
        &self,
        unmerged_path: &Path,
        unmerged_chains: &CrChains,
        merged_chains: &CrChains,
    ) -> FsResult<(Path, BlockPointer, Vec<Op>)> {
        let unmerged_original = unmerged_chains
            .original_from_most_recent(unmerged_path.tail_pointer())
            .ok_or_else(|| {
                debug!(
                    "couldn't find original pointer for {}",
                    unmerged_path.tail_pointer()
                );
                FsError::NodeNotFound(unmerged_path.tail_pointer().id)
            })?;

        let mut recreate_ops: Vec<Op> = Vec::new(); // built backwards
        let mut curr_original = unmerged_original;
        let mut curr_path = unmerged_path.clone();
        let mut merged_nodes: Vec<PathNode> = Vec::new(); // built backwards

        // First find the earliest merged parent that still exists.
        while merged_chains.is_deleted(curr_original) {
            debug!(
                "{} was deleted in the merged branch ({})",
                curr_original, curr_path
            );
            if !curr_path.has_valid_parent() {
                return Err(FsError::Internal(format!(
                    "couldn't find valid merged parent path for {}",
                    unmerged_original
                )));
            }

            let name = curr_path.tail_name().to_string();
            merged_nodes.push(PathNode {
                ptr: curr_original,
                name: name.clone(),
            });
            curr_path = curr_path.parent_path()?;
            curr_original = unmerged_chains
                .original_from_most_recent(curr_path.tail_pointer())
                .ok_or_else(|| {
                    debug!(
                        "couldn't find original pointer for {}",
                        curr_path.tail_pointer()
                    );
                    FsError::NodeNotFound(curr_path.tail_pointer().id)
                })?;

            // Placeholder entry type; the actual type is looked up
            // when the op is applied.
            recreate_ops.push(Op::recreate(curr_original, &name, EntryType::File));
        }

        if let Some(last) = recreate_ops.last_mut() {
            // The create closest to the root can use the most recent
            // merged pointer, since that parent directory exists.
            let last_create_original = last
                .primary_update()
                .map(|u| u.unref)
                .unwrap_or_else(zero_ptr);
            let merged_most_recent = merged_chains
                .most_recent_from_original(last_create_original)
                .unwrap_or(last_create_original);
            last.set_primary_update(BlockUpdate::new(merged_most_recent, zero_ptr()));
        }

        // Now find where the shared part of the path picks up in the
        // merged branch: the first ancestor either changed there, or
        // renamed away.
        let mut most_recent = zero_ptr();
        for i in (0..curr_path.nodes.len()).rev() {
            let curr_original = unmerged_chains
                .original_from_most_recent(curr_path.nodes[i].ptr)
                .ok_or_else(|| {
                    debug!("couldn't find original pointer for {}", curr_path.nodes[i].ptr);
                    FsError::NodeNotFound(curr_path.nodes[i].ptr.id)
                })?;

            // Changed in the merged branch?
            if let Some(mr) = merged_chains.most_recent_from_original(curr_original) {
                most_recent = mr;
                break;
            }

            merged_nodes.push(PathNode {
                ptr: curr_original,
                name: curr_path.nodes[i].name.clone(),
            });

            // Renamed somewhere else?
            if let Some((original_parent, new_name)) =
                merged_chains.renamed_parent_and_name(curr_original)
            {
                debug!("{} has been renamed in the merged branch", curr_original);
                let most_recent_parent = merged_chains
                    .most_recent_from_original(original_parent)
                    .ok_or_else(|| {
                        debug!("couldn't find most recent pointer for {}", original_parent);
                        FsError::NodeNotFound(original_parent.id)
                    })?;
                most_recent = most_recent_parent;
                let last = merged_nodes.len() - 1;
                merged_nodes[last].name = new_name;
                break;
            }
        }

        merged_nodes.reverse();
        recreate_ops.reverse();

        Ok((
            Path::new(unmerged_path.folder_branch.clone(), merged_nodes),
            most_recent,
            recreate_ops,
        ))
    }

    /// Maps each unmerged tail pointer to its full merged path, using
    /// placeholder nodes (original pointers) for levels deleted on the
    /// merged side.  Also returns the deduplicated recreate ops for
    /// those levels.
    async fn resolve_merged_paths(
        &self,
        ctx: &OpCtx,
        unmerged_paths: &[Path],
        unmerged_chains: &CrChains,
        merged_chains: &mut CrChains,
        most_recent_md: &RootMetadata,
    ) -> FsResult<(HashMap<BlockPointer, Path>, Vec<Op>)> {
        let mut merged_paths: HashMap<BlockPointer, Path> = HashMap::new();
        if unmerged_paths.is_empty() {
            return Ok((merged_paths, Vec::new()));
        }

        let mut recreate_ops = Vec::new();
        let mut creates_seen: HashSet<(BlockPointer, String)> = HashSet::new();
        // Merged pointer to search for -> the unmerged tails waiting
        // on its full path.
        let mut chains_to_search_for: HashMap<BlockPointer, Vec<BlockPointer>> = HashMap::new();
        for p in unmerged_paths {
            let (merged_path, most_recent, ops) = self
                .resolve_merged_path_tail(p, unmerged_chains, merged_chains)
                .await?;

            // Keep only recreates we haven't seen yet.
            for op in ops {
                let key = match &op.variant {
                    OpVariant::Create { dir, new_name, .. } => (dir.unref, new_name.clone()),
                    _ => continue,
                };
                if creates_seen.contains(&key) {
                    continue;
                }
                creates_seen.insert(key);
                recreate_ops.push(op);
            }

            chains_to_search_for
                .entry(most_recent)
                .or_default()
                .push(p.tail_pointer());
            merged_paths.insert(p.tail_pointer(), merged_path);
        }

        let new_ptrs = merged_chains.all_most_recent();
        let ptrs: Vec<BlockPointer> = chains_to_search_for.keys().copied().collect();
        let node_map = self
            .searcher
            .search_for_paths(ctx, &ptrs, &new_ptrs, most_recent_md)
            .await?;

        for (ptr, found) in node_map {
            // Everything should be findable in the merged branch.
            let Some(found_path) = found else {
                return Err(FsError::NodeNotFound(ptr.id));
            };

            for unmerged_most_recent in chains_to_search_for.get(&ptr).into_iter().flatten() {
                // Prepend the found path to the partial one.
                let merged_path = merged_paths
                    .get_mut(unmerged_most_recent)
                    .ok_or_else(|| {
                        FsError::Internal(format!(
                            "merged path missing for searched chain {}",
                            unmerged_most_recent
                        ))
                    })?;
                let mut nodes = found_path.nodes.clone();
                nodes.append(&mut merged_path.nodes);
                merged_path.nodes = nodes;
                merged_path.folder_branch = found_path.folder_branch.clone();

                // Update the final paths of the corresponding merged
                // chain, if the path exists there at all.
                let merged_most_recent = merged_path.tail_pointer();
                let merged_path = merged_path.clone();
                merged_chains.set_final_paths_by_most_recent(merged_most_recent, &merged_path);
            }
        }

        Ok((merged_paths, recreate_ops))
    }

    /// Installs each recreate op into its unmerged chain (creating the
    /// chain if needed, or prepending so later ops observe the node's
    /// re-existence), and gives each one a merged path.
    async fn add_recreate_ops_to_unmerged_chains(
        &self,
        ctx: &OpCtx,
        recreate_ops: Vec<Op>,
        unmerged_chains: &mut CrChains,
        merged_chains: &CrChains,
        merged_paths: &mut HashMap<BlockPointer, Path>,
    ) -> FsResult<Vec<Op>> {
        if recreate_ops.is_empty() {
            return Ok(recreate_ops);
        }

        // Lookup table mapping every pointer on every merged path to
        // that path's key in the merged paths map.
        let mut keys: HashMap<BlockPointer, BlockPointer> = HashMap::new();
        for (ptr, p) in merged_paths.iter() {
            for node in &p.nodes {
                keys.insert(node.ptr, *ptr);
            }
        }

        // All recreate ops are authored by the current user.
        let uid = self.kbpki.get_current_uid(ctx).await?;
        let writer_name = self.kbpki.get_normalized_username(ctx, uid).await?;

        let mut installed = Vec::with_capacity(recreate_ops.len());
        for rop in recreate_ops {
            let mut rop = rop;
            rop.common.writer_name = writer_name.clone();

            // If the op's unref is a merged most recent pointer, look
            // up the original; otherwise the unref is the original.
            // The original keys the unmerged chain this op joins.
            let rop_unref = rop
                .primary_update()
                .map(|u| u.unref)
                .unwrap_or_else(zero_ptr);
            let orig_target_ptr = merged_chains
                .original_from_most_recent(rop_unref)
                .unwrap_or(rop_unref);

            let chain_most_recent = match unmerged_chains.chain_by_original(orig_target_ptr) {
                None => {
                    // Start a fresh chain keyed so that most recent ==
                    // original, then restore the op's own view of the
                    // update.
                    let mut chain_op = rop.clone();
                    chain_op.set_primary_update(BlockUpdate::new(orig_target_ptr, orig_target_ptr));
                    unmerged_chains.make_chain_for_op(&chain_op)?;
                    let chain = unmerged_chains
                        .chain_by_original_mut(orig_target_ptr)
                        .ok_or_else(|| {
                            FsError::Internal(format!(
                                "no chain made for recreate op at {}",
                                orig_target_ptr
                            ))
                        })?;
                    if let Some(first) = chain.ops.first_mut() {
                        first.set_primary_update(BlockUpdate::new(rop_unref, zero_ptr()));
                        first.common.writer_name = writer_name.clone();
                    }
                    chain.most_recent
                }
                Some(_) => {
                    let chain = unmerged_chains
                        .chain_by_original_mut(orig_target_ptr)
                        .ok_or_else(|| {
                            FsError::Internal(format!("chain lost for {}", orig_target_ptr))
                        })?;
                    chain.ops.insert(0, rop.clone());
                    chain.most_recent
                }
            };

            // Find (or derive) the merged path for this op's chain.
            let merged_path = match merged_paths.get(&chain_most_recent) {
                Some(p) => p.clone(),
                None => {
                    let key = keys.get(&rop_unref).ok_or_else(|| {
                        FsError::Internal(format!(
                            "couldn't find a merged path containing the target of a recreate op: {}",
                            rop_unref
                        ))
                    })?;
                    let mut curr_path = merged_paths
                        .get(key)
                        .ok_or_else(|| {
                            FsError::Internal(format!("merged path table missing key {}", key))
                        })?
                        .clone();
                    while curr_path.tail_pointer() != rop_unref && curr_path.has_valid_parent() {
                        curr_path = curr_path.parent_path()?;
                    }
                    merged_paths.insert(chain_most_recent, curr_path.clone());
                    curr_path
                }
            };

            rop.set_final_path(&merged_path);
            if let Some(chain) = unmerged_chains.chain_by_most_recent_mut(chain_most_recent) {
                if let Some(first) = chain.ops.first_mut() {
                    first.set_final_path(&merged_path);
                }
            }
            installed.push(rop);
        }
        Ok(installed)
    }

    /// Checks every unmerged rename against the merged paths: if the
    /// rename's destination now descends through the renamed node
    /// itself, applying both renames would produce a cycle.  The
    /// offending unmerged create becomes a symlink pointing back up
    /// the surplus levels, and the matching rm is dropped.
    fn fix_rename_cycles(
        &self,
        unmerged_chains: &mut CrChains,
        merged_chains: &CrChains,
        merged_paths: &HashMap<BlockPointer, Path>,
    ) -> FsResult<()> {
        let renamed: Vec<(BlockPointer, crate::RenameInfo)> = unmerged_chains
            .renamed_originals
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (ptr, info) in renamed {
            // The merged path is keyed by the most recent unmerged
            // pointer of the rename's new parent.
            let parent = unmerged_chains
                .most_recent_from_original(info.original_new_parent)
                .ok_or_else(|| FsError::NodeNotFound(info.original_new_parent.id))?;

            let merged_path = merged_paths.get(&parent).ok_or_else(|| {
                // There must be one, since the parent has a create op.
                FsError::Internal(format!(
                    "fix_rename_cycles: couldn't find merged path for {}",
                    parent
                ))
            })?;

            for (i, pn) in merged_path.nodes.iter().enumerate() {
                let original = merged_chains
                    .original_from_most_recent(pn.ptr)
                    .unwrap_or(pn.ptr);
                // A node on the destination path that matches the
                // renamed pointer means a cycle.
                if original != ptr {
                    continue;
                }

                let mut sym_path = String::from("./");
                for _ in i..merged_path.nodes.len() {
                    sym_path.push_str("../");
                }

                let chain = unmerged_chains
                    .chain_by_most_recent_mut(parent)
                    .ok_or_else(|| {
                        FsError::Internal(format!(
                            "fix_rename_cycles: no chain for parent {}",
                            parent
                        ))
                    })?;

                let mut found = false;
                for op in chain.ops.iter_mut() {
                    if let OpVariant::Create {
                        new_name,
                        renamed,
                        entry_type,
                        cr_sym_path,
                        ..
                    } = &mut op.variant
                    {
                        if !*renamed || new_name != &info.new_name {
                            continue;
                        }
                        // The resolver turns this into a symlink on
                        // the merged branch later.
                        *entry_type = EntryType::Sym;
                        *cr_sym_path = sym_path.clone();
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(FsError::Internal(format!(
                        "fix_rename_cycles: couldn't find rename op corresponding to {},{} in parent {}",
                        ptr, info.new_name, parent
                    )));
                }

                // Make sure the matching rm gets dropped.
                if let Some(old_chain) =
                    unmerged_chains.chain_by_original_mut(info.original_old_parent)
                {
                    for op in old_chain.ops.iter_mut() {
                        if let OpVariant::Rm {
                            old_name,
                            drop_this,
                            ..
                        } = &mut op.variant
                        {
                            if old_name == &info.old_name {
                                *drop_this = true;
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Synthesizes the per-merged-tail action lists for every unmerged
    /// chain that has a merged path.
    fn get_actions_to_merge(
        &self,
        unmerged_chains: &CrChains,
        merged_chains: &CrChains,
        merged_paths: &HashMap<BlockPointer, Path>,
    ) -> FsResult<ResolutionActions> {
        let mut action_map: ResolutionActions = HashMap::new();
        for (unmerged_most_recent, unmerged_chain) in unmerged_chains.iter_by_most_recent() {
            let original = unmerged_chain.original;
            let merged_chain = merged_chains.chain_by_original(original);
            let Some(merged_path) = merged_paths.get(&unmerged_most_recent) else {
                // Created or deleted in the unmerged branch, so no
                // merged path yet.
                continue;
            };

            let mut actions = unmerged_chain.actions_to_merge(
                self.renamer.as_ref(),
                merged_path,
                merged_chain,
            )?;

            // An unmerged rm of a node that was modified on the merged
            // side must be dropped.
            for op in &unmerged_chain.ops {
                let OpVariant::Rm { .. } = &op.variant else {
                    continue;
                };

                for ptr in &op.common.unrefs {
                    let unref_original = unmerged_chains
                        .original_from_most_recent(*ptr)
                        .unwrap_or(*ptr);
                    if merged_chains.chain_by_original(unref_original).is_some() {
                        actions.push(CrAction::DropUnmerged { op: op.clone() });
                    }
                }

                // An rm with no unrefs gives no way to discover its
                // rename target here; leave it alone.
            }

            if !actions.is_empty() {
                action_map.insert(merged_path.tail_pointer(), actions);
            }
        }
        Ok(action_map)
    }
}
