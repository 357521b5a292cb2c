mod tests {
    use crate::{BlockReadier, FileData, SyncHook};
    use async_trait::async_trait;
    use block_lib::{
        BlockContext, BlockId, BlockInfo, BlockPointer, BlockReqType, BlockSplitter, DirEntry,
        DirtyBlockCache, DirtyBlockCacheStandard, DirtyBlockCacher, FileBlock, FileBlockGetter,
        FolderBranch, FsError, FsResult, IndirectFilePtr, KeyGen, OpCtx, Path, PathNode,
        RandCrypto, SimpleBlockSplitter, UserId, FIRST_VALID_DATA_VER,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct BlockStore {
        folder: FolderBranch,
        dirty: Arc<DirtyBlockCacheStandard>,
        clean: Mutex<HashMap<BlockPointer, FileBlock>>,
    }

    impl BlockStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                folder: FolderBranch::default(),
                dirty: Arc::new(DirtyBlockCacheStandard::new()),
                clean: Mutex::new(HashMap::new()),
            })
        }

        fn get(&self, ptr: BlockPointer) -> FsResult<(FileBlock, bool)> {
            if let Some(b) = self.dirty.get(self.folder.tlf, &self.folder.branch, ptr) {
                return Ok((b, true));
            }
            self.clean
                .lock()
                .unwrap()
                .get(&ptr)
                .cloned()
                .map(|b| (b, false))
                .ok_or(FsError::NoSuchBlock(ptr.id))
        }
    }

    struct StoreGetter(Arc<BlockStore>);

    #[async_trait]
    impl FileBlockGetter for StoreGetter {
        async fn get_file_block(
            &self,
            ctx: &OpCtx,
            ptr: BlockPointer,
            _file: &Path,
            _req: BlockReqType,
        ) -> FsResult<(FileBlock, bool)> {
            ctx.check()?;
            self.0.get(ptr)
        }
    }

    struct StoreCacher(Arc<BlockStore>);

    impl DirtyBlockCacher for StoreCacher {
        fn cache(&self, ptr: BlockPointer, block: FileBlock) -> FsResult<()> {
            self.0
                .dirty
                .put(self.0.folder.tlf, &self.0.folder.branch, ptr, block)
        }
    }

    fn test_ptr(seed: u8) -> BlockPointer {
        let mut id = BlockId::default();
        id.0[0] = seed;
        id.0[1] = 0xfe;
        BlockPointer {
            id,
            key_gen: KeyGen(1),
            data_ver: FIRST_VALID_DATA_VER,
            context: BlockContext::first(UserId(1)),
        }
    }

    struct TestFile {
        store: Arc<BlockStore>,
        fd: FileData,
        dirty_bcache: Arc<dyn DirtyBlockCache>,
        root_ptr: BlockPointer,
        de: DirEntry,
    }

    fn make_file(bsplit: Arc<dyn BlockSplitter>) -> TestFile {
        let store = BlockStore::new();
        let root_ptr = test_ptr(100);
        store
            .clean
            .lock()
            .unwrap()
            .insert(root_ptr, FileBlock::new_direct());
        let file = Path::new(
            store.folder.clone(),
            vec![PathNode {
                ptr: root_ptr,
                name: "file".to_string(),
            }],
        );
        let fd = FileData::new(
            file,
            UserId(1),
            KeyGen(1),
            bsplit,
            Arc::new(RandCrypto),
            Arc::new(StoreGetter(store.clone())),
            Arc::new(StoreCacher(store.clone())),
        );
        let dirty_bcache: Arc<dyn DirtyBlockCache> = store.dirty.clone();
        TestFile {
            store,
            fd,
            dirty_bcache,
            root_ptr,
            de: DirEntry::default(),
        }
    }

    fn simple_file(max_size: usize, max_ptrs: usize) -> TestFile {
        make_file(Arc::new(SimpleBlockSplitter::new(max_size, max_ptrs)))
    }

    impl TestFile {
        async fn top(&self) -> FileBlock {
            self.store.get(self.root_ptr).unwrap().0
        }

        async fn write(&mut self, data: &[u8], off: i64) -> crate::WriteResult {
            let ctx = OpCtx::background();
            let top = self.top().await;
            let res = self
                .fd
                .write(&ctx, data, off, top, self.de.clone(), &self.dirty_bcache)
                .await
                .unwrap();
            self.de = res.new_de.clone();
            res
        }

        async fn truncate_extend(&mut self, size: u64) -> Vec<BlockPointer> {
            let ctx = OpCtx::background();
            let top = self.top().await;
            let at = self
                .fd
                .get_block_at_offset(&ctx, &top, size as i64, BlockReqType::Write)
                .await
                .unwrap();
            let (new_de, dirty_ptrs) = self
                .fd
                .truncate_extend(&ctx, size, top, at.parents, self.de.clone(), &self.dirty_bcache)
                .await
                .unwrap();
            self.de = new_de;
            dirty_ptrs
        }

        async fn truncate_shrink(&mut self, size: u64) -> crate::TruncateResult {
            let ctx = OpCtx::background();
            let top = self.top().await;
            let res = self
                .fd
                .truncate_shrink(&ctx, size, top, self.de.clone())
                .await
                .unwrap();
            self.de = res.new_de.clone();
            res
        }

        async fn read_at(&self, len: usize, off: i64) -> Vec<u8> {
            let ctx = OpCtx::background();
            let mut dest = vec![0u8; len];
            let n = self.fd.read(&ctx, &mut dest, off).await.unwrap();
            assert!(n as usize <= len);
            dest
        }

        /// Collects (ptr, start_off, contents) for every leaf, and
        /// checks the offset invariants on the way: children strictly
        /// increasing, first child starting where the parent does.
        fn collect_leaves(&self) -> Vec<(BlockPointer, i64, Vec<u8>)> {
            let mut leaves = Vec::new();
            self.walk(self.root_ptr, 0, &mut leaves);
            leaves
        }

        fn walk(
            &self,
            ptr: BlockPointer,
            expected_off: i64,
            leaves: &mut Vec<(BlockPointer, i64, Vec<u8>)>,
        ) {
            let (block, _) = self.store.get(ptr).unwrap();
            if !block.is_ind {
                leaves.push((ptr, expected_off, block.contents));
                return;
            }
            assert!(!block.iptrs.is_empty());
            assert_eq!(
                block.iptrs[0].off, expected_off,
                "first child must start where the parent does"
            );
            let mut prev = i64::MIN;
            for iptr in &block.iptrs {
                assert!(iptr.off > prev, "child offsets must strictly increase");
                prev = iptr.off;
            }
            for iptr in &block.iptrs {
                self.walk(iptr.info.pointer, iptr.off, leaves);
            }
        }

        fn is_dirty(&self, ptr: BlockPointer) -> bool {
            let fb = &self.store.folder;
            self.dirty_bcache.is_dirty(fb.tlf, ptr, &fb.branch)
        }

        /// Every dirty leaf must have only dirty ancestors.
        fn assert_dirty_ancestor_closure(&self) {
            self.check_dirty_closure(self.root_ptr, &mut Vec::new());
        }

        fn check_dirty_closure(&self, ptr: BlockPointer, ancestors: &mut Vec<BlockPointer>) {
            let (block, _) = self.store.get(ptr).unwrap();
            if !block.is_ind {
                if self.is_dirty(ptr) {
                    for a in ancestors.iter() {
                        assert!(
                            self.is_dirty(*a),
                            "ancestor {} of dirty leaf {} must be dirty",
                            a,
                            ptr
                        );
                    }
                }
                return;
            }
            ancestors.push(ptr);
            for iptr in &block.iptrs {
                self.check_dirty_closure(iptr.info.pointer, ancestors);
            }
            ancestors.pop();
        }
    }

    // ---- writes and reads ----

    #[tokio::test]
    async fn test_sparse_write_round_trip() {
        let mut f = simple_file(64, 2);
        let res = f.write(b"ABC", 10).await;

        assert_eq!(f.de.size, 13);
        assert_eq!(f.de.info.encoded_size, 0);
        assert_eq!(res.bytes_extended, 13);
        let top = f.top().await;
        assert!(!top.is_ind);
        assert_eq!(f.store.dirty.dirty_count(), 1);

        let data = f.read_at(14, 0).await;
        let mut expected = vec![0u8; 10];
        expected.extend_from_slice(b"ABC");
        expected.push(0);
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn test_write_forces_split_to_indirect() {
        let mut f = simple_file(4, 2);
        let res = f.write(b"ABCDEFG", 0).await;

        assert_eq!(res.bytes_extended, 7);
        assert_eq!(f.de.size, 7);

        let top = f.top().await;
        assert!(top.is_ind);
        assert_eq!(top.iptrs.len(), 2);
        assert_eq!(top.iptrs[0].off, 0);
        assert_eq!(top.iptrs[1].off, 4);

        let leaves = f.collect_leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].2, b"ABCD");
        assert_eq!(leaves[1].2, b"EFG");

        // Both leaves and the new root were dirtied.
        assert!(res.dirty_ptrs.contains(&f.root_ptr));
        assert!(res.dirty_ptrs.contains(&leaves[0].0));
        assert!(res.dirty_ptrs.contains(&leaves[1].0));

        let data = f.read_at(7, 0).await;
        assert_eq!(data, b"ABCDEFG");
    }

    #[tokio::test]
    async fn test_read_after_write_multi_level() {
        let mut f = simple_file(4, 2);
        let payload: Vec<u8> = (0u8..32).collect();
        f.write(&payload, 0).await;

        assert_eq!(f.de.size, 32);
        let data = f.read_at(32, 0).await;
        assert_eq!(data, payload);

        let leaves = f.collect_leaves();
        assert_eq!(leaves.len(), 8);
        f.assert_dirty_ancestor_closure();

        // Overwrite a few bytes in the middle and re-verify.
        f.write(b"zz", 9).await;
        let mut expected = payload.clone();
        expected[9] = b'z';
        expected[10] = b'z';
        assert_eq!(f.read_at(32, 0).await, expected);
        assert_eq!(f.de.size, 32);
        f.collect_leaves();
        f.assert_dirty_ancestor_closure();
    }

    #[tokio::test]
    async fn test_holes_read_as_zeros() {
        let mut f = simple_file(64, 4);
        f.truncate_extend(1_000_000).await;
        assert_eq!(f.de.size, 1_000_000);
        assert_eq!(f.de.info.encoded_size, 0);

        let data = f.read_at(1024, 500_000).await;
        assert_eq!(data, vec![0u8; 1024]);

        let top = f.top().await;
        assert!(top.is_ind);
        for iptr in &top.iptrs {
            assert!(iptr.holes);
        }
        assert!(f.is_dirty(f.root_ptr));
    }

    #[tokio::test]
    async fn test_write_at_hole_fills_only_the_hole() {
        let mut f = simple_file(64, 4);
        f.truncate_extend(100).await;
        f.write(b"XY", 10).await;
        assert_eq!(f.de.size, 100);

        let data = f.read_at(100, 0).await;
        for (i, b) in data.iter().enumerate() {
            match i {
                10 => assert_eq!(*b, b'X'),
                11 => assert_eq!(*b, b'Y'),
                _ => assert_eq!(*b, 0, "byte {} should be zero", i),
            }
        }
        f.collect_leaves();
        f.assert_dirty_ancestor_closure();
    }

    #[tokio::test]
    async fn test_write_into_hole_shifts_new_block_into_place() {
        let mut f = simple_file(4, 2);
        f.truncate_extend(40).await;
        f.write(b"x", 8).await;
        assert_eq!(f.de.size, 40);

        // Offset invariants hold even though the new block started
        // out at the far right of the tree.
        let leaves = f.collect_leaves();
        assert!(leaves.iter().any(|(_, off, contents)| {
            *off == 8 && contents.first() == Some(&b'x')
        }));
        f.assert_dirty_ancestor_closure();

        let data = f.read_at(40, 0).await;
        for (i, b) in data.iter().enumerate() {
            if i == 8 {
                assert_eq!(*b, b'x');
            } else {
                assert_eq!(*b, 0, "byte {} should be zero", i);
            }
        }
    }

    // ---- synced-tree fixtures ----

    /// A clean two-leaf indirect file, as if it had been fully synced:
    /// non-zero encoded sizes everywhere.
    fn synced_two_leaf_file(max_size: usize, max_ptrs: usize) -> (TestFile, BlockInfo, BlockInfo) {
        let f = simple_file(max_size, max_ptrs);
        let ptr_a = test_ptr(1);
        let ptr_b = test_ptr(2);
        let info_a = BlockInfo {
            pointer: ptr_a,
            encoded_size: 100,
        };
        let info_b = BlockInfo {
            pointer: ptr_b,
            encoded_size: 200,
        };
        let mut root = FileBlock::new_indirect();
        root.iptrs.push(IndirectFilePtr {
            info: info_a,
            off: 0,
            holes: false,
        });
        root.iptrs.push(IndirectFilePtr {
            info: info_b,
            off: 4,
            holes: false,
        });
        let mut leaf_a = FileBlock::new_direct();
        leaf_a.contents = b"ABCD".to_vec();
        let mut leaf_b = FileBlock::new_direct();
        leaf_b.contents = b"EFGH".to_vec();
        {
            let mut clean = f.store.clean.lock().unwrap();
            clean.insert(f.root_ptr, root);
            clean.insert(ptr_a, leaf_a);
            clean.insert(ptr_b, leaf_b);
        }
        let mut f = f;
        f.de.size = 8;
        f.de.info = BlockInfo {
            pointer: f.root_ptr,
            encoded_size: 50,
        };
        (f, info_a, info_b)
    }

    #[tokio::test]
    async fn test_write_zeroes_encoded_sizes_into_unrefs() {
        let (mut f, info_a, info_b) = synced_two_leaf_file(4, 2);
        let res = f.write(b"xy", 2).await;

        // Only the first leaf was touched.
        assert!(res.unrefs.contains(&info_a));
        assert!(!res.unrefs.contains(&info_b));
        let top = f.top().await;
        assert_eq!(top.iptrs[0].info.encoded_size, 0);
        assert_eq!(top.iptrs[1].info.encoded_size, 200);

        let data = f.read_at(8, 0).await;
        assert_eq!(data, b"ABxyEFGH");
    }

    #[tokio::test]
    async fn test_write_across_leaves_unrefs_each_exactly_once() {
        let (mut f, info_a, info_b) = synced_two_leaf_file(4, 2);
        let res = f.write(b"01234567", 0).await;

        assert_eq!(
            res.unrefs.iter().filter(|i| **i == info_a).count(),
            1,
            "first leaf unref'd exactly once"
        );
        assert_eq!(
            res.unrefs.iter().filter(|i| **i == info_b).count(),
            1,
            "second leaf unref'd exactly once"
        );
        let top = f.top().await;
        assert_eq!(top.iptrs[0].info.encoded_size, 0);
        assert_eq!(top.iptrs[1].info.encoded_size, 0);
        assert_eq!(f.read_at(8, 0).await, b"01234567");
    }

    // ---- truncate ----

    #[tokio::test]
    async fn test_truncate_shrink_drops_subtree() {
        let (mut f, _info_a, info_b) = synced_two_leaf_file(4, 2);
        let res = f.truncate_shrink(3).await;

        assert_eq!(f.de.size, 3);
        assert_eq!(f.de.info.encoded_size, 0);
        assert!(res.unrefs.contains(&info_b));

        let top = f.top().await;
        assert!(top.is_ind);
        assert_eq!(top.iptrs.len(), 1);
        let leaves = f.collect_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].2, b"ABC");

        assert_eq!(f.read_at(3, 0).await, b"ABC");
    }

    #[tokio::test]
    async fn test_truncate_shrink_within_single_block() {
        let mut f = simple_file(64, 2);
        f.write(b"hello world", 0).await;
        let res = f.truncate_shrink(5).await;

        assert_eq!(f.de.size, 5);
        assert_eq!(f.read_at(5, 0).await, b"hello");
        assert!(res.unrefs.is_empty());
    }

    #[tokio::test]
    async fn test_truncate_extend_then_write_round_trip() {
        let mut f = simple_file(8, 2);
        f.write(b"abc", 0).await;
        f.truncate_extend(50).await;
        assert_eq!(f.de.size, 50);

        let data = f.read_at(50, 0).await;
        assert_eq!(&data[..3], b"abc");
        assert!(data[3..].iter().all(|b| *b == 0));
        f.collect_leaves();
        f.assert_dirty_ancestor_closure();
    }

    // ---- adaptive split ----

    /// Splitter with a hard target size: oversized dirty blocks are
    /// cut at the target, undersized ones ask to pull bytes from the
    /// right when `greedy` is set.
    struct TargetSplitter {
        inner: SimpleBlockSplitter,
        target: i64,
        greedy: bool,
    }

    impl TargetSplitter {
        fn new(target: usize, max_ptrs: usize, greedy: bool) -> Self {
            Self {
                inner: SimpleBlockSplitter::new(target, max_ptrs),
                target: target as i64,
                greedy,
            }
        }
    }

    impl BlockSplitter for TargetSplitter {
        fn max_ptrs_per_block(&self) -> usize {
            self.inner.max_ptrs_per_block()
        }

        fn copy_until_split(
            &self,
            block: &mut FileBlock,
            is_last: bool,
            data: &[u8],
            off: i64,
        ) -> i64 {
            self.inner.copy_until_split(block, is_last, data, off)
        }

        fn check_split(&self, block: &FileBlock) -> i64 {
            let len = block.contents.len() as i64;
            if len > self.target {
                self.target
            } else if self.greedy && len < self.target {
                len - self.target
            } else {
                0
            }
        }
    }

    /// Builds a dirty two-leaf indirect file with the given contents.
    async fn dirty_two_leaf_file(
        bsplit: Arc<dyn BlockSplitter>,
        left: &[u8],
        right: &[u8],
    ) -> TestFile {
        let mut f = make_file(bsplit);
        let ptr_a = test_ptr(1);
        let ptr_b = test_ptr(2);
        let mut root = FileBlock::new_indirect();
        root.iptrs.push(IndirectFilePtr {
            info: BlockInfo {
                pointer: ptr_a,
                encoded_size: 0,
            },
            off: 0,
            holes: false,
        });
        root.iptrs.push(IndirectFilePtr {
            info: BlockInfo {
                pointer: ptr_b,
                encoded_size: 0,
            },
            off: left.len() as i64,
            holes: false,
        });
        let mut leaf_a = FileBlock::new_direct();
        leaf_a.contents = left.to_vec();
        let mut leaf_b = FileBlock::new_direct();
        leaf_b.contents = right.to_vec();
        let fb = f.store.folder.clone();
        f.store.dirty.put(fb.tlf, &fb.branch, f.root_ptr, root).unwrap();
        f.store.dirty.put(fb.tlf, &fb.branch, ptr_a, leaf_a).unwrap();
        f.store.dirty.put(fb.tlf, &fb.branch, ptr_b, leaf_b).unwrap();
        f.de.size = (left.len() + right.len()) as u64;
        f
    }

    #[tokio::test]
    async fn test_split_oversized_blocks() {
        let ctx = OpCtx::background();
        let bsplit = Arc::new(TargetSplitter::new(4, 4, false));
        // The left leaf carries six bytes; two get pushed rightward.
        let f = dirty_two_leaf_file(bsplit.clone(), b"ABCDEF", b"GH").await;
        let top = f.top().await;
        f.fd.split(&ctx, &f.dirty_bcache, &top).await.unwrap();

        let leaves = f.collect_leaves();
        let all: Vec<u8> = leaves.iter().flat_map(|(_, _, c)| c.clone()).collect();
        assert_eq!(all, b"ABCDEFGH");
        for (_, _, contents) in &leaves {
            let mut block = FileBlock::new_direct();
            block.contents = contents.clone();
            assert_eq!(
                bsplit.check_split(&block),
                0,
                "every leaf is split correctly after split()"
            );
        }
        f.assert_dirty_ancestor_closure();
    }

    #[tokio::test]
    async fn test_split_pulls_bytes_into_undersized_block() {
        let ctx = OpCtx::background();
        let bsplit = Arc::new(TargetSplitter::new(4, 4, true));
        // The left leaf wants more bytes; the right one empties out
        // and gets dropped from its parent.
        let f = dirty_two_leaf_file(bsplit.clone(), b"AB", b"CD").await;
        let top = f.top().await;
        f.fd.split(&ctx, &f.dirty_bcache, &top).await.unwrap();

        let leaves = f.collect_leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].2, b"ABCD");
        let top = f.top().await;
        assert_eq!(top.iptrs.len(), 1);
    }

    // ---- ready ----

    struct MockReadier {
        puts: Mutex<Vec<(BlockInfo, FileBlock)>>,
        hooks: Mutex<Vec<SyncHook>>,
    }

    impl MockReadier {
        fn new() -> Self {
            Self {
                puts: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BlockReadier for MockReadier {
        async fn ready_block(&self, ctx: &OpCtx, block: &FileBlock) -> FsResult<BlockInfo> {
            ctx.check()?;
            let encoded = serde_json::to_vec(block)
                .map_err(|e| FsError::Internal(format!("encode failed: {}", e)))?;
            Ok(BlockInfo {
                pointer: BlockPointer {
                    id: BlockId::from_hash(&encoded),
                    key_gen: KeyGen(1),
                    data_ver: FIRST_VALID_DATA_VER,
                    context: BlockContext::first(UserId(1)),
                },
                encoded_size: encoded.len() as u32,
            })
        }

        fn queue_block_put(
            &self,
            info: BlockInfo,
            block: FileBlock,
            on_sync: Option<SyncHook>,
        ) -> FsResult<()> {
            self.puts.lock().unwrap().push((info, block));
            if let Some(hook) = on_sync {
                self.hooks.lock().unwrap().push(hook);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ready_assigns_permanent_infos_bottom_up() {
        let ctx = OpCtx::background();
        let mut f = simple_file(4, 2);
        let payload: Vec<u8> = (0u8..16).collect();
        f.write(&payload, 0).await;

        let leaves_before: Vec<BlockPointer> =
            f.collect_leaves().into_iter().map(|(p, _, _)| p).collect();

        let readier = MockReadier::new();
        let top = f.top().await;
        let old_ptrs = f
            .fd
            .ready(&ctx, &f.dirty_bcache, &top, &readier)
            .await
            .unwrap();

        // Everything but the root got a permanent info.
        assert!(!old_ptrs.is_empty());
        for (info, _old) in &old_ptrs {
            assert_ne!(info.encoded_size, 0);
        }

        // The leaf hooks clear the old dirty bindings once fired.
        let hooks = readier.hooks.lock().unwrap();
        assert_eq!(hooks.len(), leaves_before.len());
        for hook in hooks.iter() {
            hook().unwrap();
        }
        for old_leaf in &leaves_before {
            assert!(f.store.dirty.was_synced(*old_leaf));
        }
    }

    #[tokio::test]
    async fn test_ready_on_direct_file_is_a_noop() {
        let ctx = OpCtx::background();
        let mut f = simple_file(64, 2);
        f.write(b"abc", 0).await;
        let readier = MockReadier::new();
        let top = f.top().await;
        let old_ptrs = f
            .fd
            .ready(&ctx, &f.dirty_bcache, &top, &readier)
            .await
            .unwrap();
        assert!(old_ptrs.is_empty());
        assert!(readier.puts.lock().unwrap().is_empty());
    }

    // ---- deep copy ----

    #[tokio::test]
    async fn test_deep_copy_direct_file_shares_ciphertext() {
        let ctx = OpCtx::background();
        let mut f = simple_file(64, 2);
        f.write(b"shared", 0).await;

        let (new_ptr, children) = f.fd.deep_copy(&ctx, FIRST_VALID_DATA_VER).await.unwrap();
        assert_eq!(new_ptr.id, f.root_ptr.id, "ciphertext is shared by id");
        assert_ne!(
            new_ptr.context.ref_nonce,
            f.root_ptr.context.ref_nonce,
            "but under a fresh reference"
        );
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_deep_copy_indirect_file_dupes_children() {
        let ctx = OpCtx::background();
        let mut f = simple_file(4, 2);
        f.write(b"ABCDEFG", 0).await;

        let top = f.top().await;
        let (new_ptr, children) = f.fd.deep_copy(&ctx, FIRST_VALID_DATA_VER).await.unwrap();
        assert_ne!(new_ptr.id, f.root_ptr.id, "indirect root gets a fresh id");
        assert_eq!(children.len(), top.iptrs.len());
        for (child, orig) in children.iter().zip(top.iptrs.iter()) {
            assert_eq!(child.id, orig.info.pointer.id);
            assert_ne!(child.context.ref_nonce, orig.info.pointer.context.ref_nonce);
        }

        // The copy reads back the same bytes.
        let (copy_block, _) = f.store.get(new_ptr).unwrap();
        assert!(copy_block.is_ind);
        assert_eq!(copy_block.iptrs.len(), top.iptrs.len());
    }

    // ---- misc ----

    #[tokio::test]
    async fn test_get_bytes_and_byte_slice_edge_cases() {
        let mut f = simple_file(4, 2);
        f.write(b"0123456789", 0).await;
        let ctx = OpCtx::background();

        // Whole-file read via EOF sentinel.
        let data = f.fd.get_bytes(&ctx, 0, -1).await.unwrap();
        assert_eq!(data, b"0123456789");

        // Interior range spanning a block boundary.
        let data = f.fd.get_bytes(&ctx, 3, 7).await.unwrap();
        assert_eq!(data, b"3456");

        // Empty and invalid ranges.
        let slices = f.fd.get_byte_slices_in_range(&ctx, 5, 5, false).await.unwrap();
        assert!(slices.is_empty());
        assert!(f.fd.get_byte_slices_in_range(&ctx, -1, 4, false).await.is_err());
        assert!(f.fd.get_byte_slices_in_range(&ctx, 0, -2, false).await.is_err());
    }

    #[tokio::test]
    async fn test_read_past_eof_returns_short_count() {
        let mut f = simple_file(64, 2);
        f.write(b"short", 0).await;
        let ctx = OpCtx::background();
        let mut dest = vec![0u8; 64];
        let n = f.fd.read(&ctx, &mut dest, 0).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&dest[..5], b"short");
    }

    #[tokio::test]
    async fn test_find_iptr_and_clear_size() {
        let (f, info_a, _) = synced_two_leaf_file(4, 2);
        let mut top = f.top().await;
        assert!(f.fd.find_iptr_and_clear_size(&mut top, info_a.pointer));
        assert_eq!(top.iptrs[0].info.encoded_size, 0);
        assert!(!f.fd.find_iptr_and_clear_size(&mut top, test_ptr(99)));
    }

    #[tokio::test]
    async fn test_get_indirect_file_block_infos() {
        let ctx = OpCtx::background();
        let (f, info_a, info_b) = synced_two_leaf_file(4, 2);
        let infos = f.fd.get_indirect_file_block_infos(&ctx).await.unwrap();
        assert_eq!(infos, vec![info_a, info_b]);
    }

    #[tokio::test]
    async fn test_canceled_context_aborts_read() {
        let mut f = simple_file(4, 2);
        f.write(b"0123456789", 0).await;
        let ctx = OpCtx::background();
        ctx.cancel();
        let mut dest = vec![0u8; 4];
        let err = f.fd.read(&ctx, &mut dest, 0).await.unwrap_err();
        assert!(matches!(err, FsError::Canceled));
    }
}
