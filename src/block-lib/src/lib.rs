#![allow(clippy::result_large_err)]

mod block;
mod def;
mod dirty_cache;
mod fs_path;
mod splitter;

pub use block::*;
pub use def::*;
pub use dirty_cache::*;
pub use fs_path::*;
pub use splitter::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("path is in an incorrect format: {0}")]
    BadPath(String),
    #[error("{0} is not a directory")]
    NotDir(String),
    #[error("{0} is not a file")]
    NotFile(String),
    #[error("couldn't get block {0}")]
    NoSuchBlock(BlockId),
    #[error("bad data for block {0}")]
    BadData(BlockId),
    #[error("bad crypto for block {0}")]
    BadCrypto(BlockId),
    #[error("wrong format for metadata of folder {0}")]
    BadMd(String),
    #[error("bad crypto for the metadata of folder {0}")]
    BadCryptoMd(String),
    #[error("could not verify metadata for folder {0}: {1}")]
    MdMismatch(String, String),
    #[error("data at {0} has version {1} that we can't read")]
    NewVersion(String, DataVer),
    #[error("data at {0} is keyed with key generation {1} that we don't know")]
    NewKeyVersion(String, KeyGen),
    #[error("unexpected bad block split")]
    BadSplit,
    #[error("expected {expected} bytes, got {actual} bytes")]
    InconsistentByteCount { expected: usize, actual: usize },
    #[error("expected at most {max} bytes, got {actual} bytes")]
    TooHighByteCount { max: usize, actual: usize },
    #[error("expected at least {min} bytes, got {actual} bytes")]
    TooLowByteCount { min: usize, actual: usize },
    #[error("block pointer to dirty block {0} with non-zero encoded size {1}")]
    InconsistentBlockPointer(BlockId, u32),
    #[error("this request needs exclusive access, but doesn't have it")]
    WriteNeededInReadRequest,
    #[error("no path found to node {0}")]
    NodeNotFound(BlockId),
    #[error("operation canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// True for the failure modes a prefix-tolerant read is allowed to
    /// swallow (returning the data gathered so far).
    pub fn is_deadline(&self) -> bool {
        matches!(self, FsError::DeadlineExceeded)
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;
