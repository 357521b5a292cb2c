use crate::{BlockId, BlockPointer, BranchName, FileBlock, FsError, FsResult, Path, RefNonce, TlfId, UserId};
use async_trait::async_trait;
use rand::RngCore;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a block is being requested.  `Write` must hand back a block the
/// caller is free to mutate; `Read` may return shared data;
/// `ReadParallel` is a read issued from a concurrent range fetch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockReqType {
    Read,
    Write,
    ReadParallel,
}

impl BlockReqType {
    pub fn for_write(&self) -> bool {
        matches!(self, BlockReqType::Write)
    }
}

/// Cancellation scope and optional deadline carried into every
/// collaborator call.  Cloning shares the same cancellation token.
#[derive(Clone, Debug, Default)]
pub struct OpCtx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpCtx {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// A child scope that is canceled when this one is, and which can
    /// additionally be canceled on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child scope whose deadline is the earlier of the current one
    /// and `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d < deadline => d,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails fast if this scope has been canceled or its deadline has
    /// passed.  Checked at the boundary of every suspending step.
    pub fn check(&self) -> FsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(FsError::Canceled);
        }
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(FsError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// Fetches a block for reading or writing, reporting whether it was
/// already dirty.  May be called from concurrent tasks.
#[async_trait]
pub trait FileBlockGetter: Send + Sync {
    async fn get_file_block(
        &self,
        ctx: &OpCtx,
        ptr: BlockPointer,
        file: &Path,
        req: BlockReqType,
    ) -> FsResult<(FileBlock, bool)>;
}

/// Installs or updates the dirty binding for a pointer.
pub trait DirtyBlockCacher: Send + Sync {
    fn cache(&self, ptr: BlockPointer, block: FileBlock) -> FsResult<()>;
}

/// Tracks, per folder branch, which pointers refer to locally modified
/// blocks that haven't been synced yet.
pub trait DirtyBlockCache: Send + Sync {
    fn is_dirty(&self, tlf: TlfId, ptr: BlockPointer, branch: &BranchName) -> bool;
    /// Forget the dirty state for `ptr` without treating it as synced.
    fn set_not_dirty(&self, ptr: BlockPointer);
    /// Record that the put for `ptr`'s replacement completed.
    fn set_synced(&self, ptr: BlockPointer) -> FsResult<()>;
}

/// Decides how file bytes are carved into leaf blocks.
pub trait BlockSplitter: Send + Sync {
    /// Fan-out limit for indirect blocks.
    fn max_ptrs_per_block(&self) -> usize;

    /// Copy as much of `data` as fits into `block.contents` starting
    /// at `off`, returning the number of bytes copied.  May stop early
    /// to respect a target block size.  `is_last` is true when the
    /// block is (or will become) the rightmost block of the file.
    fn copy_until_split(&self, block: &mut FileBlock, is_last: bool, data: &[u8], off: i64)
        -> i64;

    /// Advisory cut point for a dirty block: 0 to leave it alone, a
    /// positive index to split there, negative to pull in more bytes.
    fn check_split(&self, block: &FileBlock) -> i64;
}

/// Mints ids and nonces that don't depend on block contents.
pub trait CryptoPure: Send + Sync {
    fn make_temporary_block_id(&self) -> FsResult<BlockId>;
    fn make_block_ref_nonce(&self) -> FsResult<RefNonce>;
}

/// Identity lookups for the current device's user.
#[async_trait]
pub trait Kbpki: Send + Sync {
    async fn get_current_uid(&self, ctx: &OpCtx) -> FsResult<UserId>;
    async fn get_normalized_username(&self, ctx: &OpCtx, uid: UserId) -> FsResult<String>;
}

/// `CryptoPure` over the system RNG.
#[derive(Default)]
pub struct RandCrypto;

impl CryptoPure for RandCrypto {
    fn make_temporary_block_id(&self) -> FsResult<BlockId> {
        let mut id = BlockId::default();
        rand::thread_rng().fill_bytes(&mut id.0);
        Ok(id)
    }

    fn make_block_ref_nonce(&self) -> FsResult<RefNonce> {
        let mut nonce = RefNonce::default();
        rand::thread_rng().fill_bytes(&mut nonce.0);
        Ok(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctx_deadline_check() {
        let ctx = OpCtx::background();
        assert!(ctx.check().is_ok());

        let expired = ctx.with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(expired.check(), Err(FsError::DeadlineExceeded)));

        // A child deadline never extends the parent's.
        let far = expired.with_timeout(Duration::from_secs(60));
        assert!(matches!(far.check(), Err(FsError::DeadlineExceeded)));
    }

    #[test]
    fn test_ctx_cancel_propagates_to_children() {
        let ctx = OpCtx::background();
        let child = ctx.child();
        ctx.cancel();
        assert!(matches!(child.check(), Err(FsError::Canceled)));
    }

    #[test]
    fn test_rand_crypto_mints_distinct_ids() {
        let crypto = RandCrypto;
        let a = crypto.make_temporary_block_id().unwrap();
        let b = crypto.make_temporary_block_id().unwrap();
        assert_ne!(a, b);
        let n1 = crypto.make_block_ref_nonce().unwrap();
        let n2 = crypto.make_block_ref_nonce().unwrap();
        assert_ne!(n1, n2);
    }
}
