mod file_data;

pub use file_data::*;

use async_trait::async_trait;
use block_lib::{BlockInfo, FileBlock, FsResult, OpCtx};

#[macro_use]
extern crate log;

#[cfg(test)]
mod file_data_tests;

/// Callback invoked once the put for a readied block has completed on
/// the server, so the old dirty binding can be released.
pub type SyncHook = Box<dyn Fn() -> FsResult<()> + Send + Sync>;

/// Encrypts, encodes and queues dirty blocks for an upcoming sync.
#[async_trait]
pub trait BlockReadier: Send + Sync {
    /// Encrypt and encode a dirty block, assigning its permanent id,
    /// and return the resulting block info.
    async fn ready_block(&self, ctx: &OpCtx, block: &FileBlock) -> FsResult<BlockInfo>;

    /// Queue a readied block for the put that finishes the sync.  The
    /// hook, if any, fires when that put completes.
    fn queue_block_put(
        &self,
        info: BlockInfo,
        block: FileBlock,
        on_sync: Option<SyncHook>,
    ) -> FsResult<()>;
}
