use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of a block identifier in bytes.
pub const BLOCK_ID_LEN: usize = 32;

/// Content-addressed name for an encrypted block.  Permanent ids are
/// derived from the ciphertext hash at sync time; temporary ids are
/// random and only ever live in the dirty cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockId(pub [u8; BLOCK_ID_LEN]);

impl BlockId {
    pub fn from_hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        BlockId(hasher.finalize().into())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; BLOCK_ID_LEN]
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

/// Reference nonce distinguishing multiple references to the same
/// ciphertext.  The zero nonce marks the first (creating) reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

pub const ZERO_REF_NONCE: RefNonce = RefNonce([0u8; 8]);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{:x}", self.0)
    }
}

/// Key generation under which a block was encrypted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug, Serialize, Deserialize)]
pub struct KeyGen(pub u32);

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk data format version for a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug, Serialize, Deserialize)]
pub struct DataVer(pub u32);

impl fmt::Display for DataVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const FIRST_VALID_DATA_VER: DataVer = DataVer(1);
pub const FILES_WITH_HOLES_DATA_VER: DataVer = DataVer(2);

/// Version to use for a freshly allocated block, depending on whether
/// the containing file may contain holes.
pub fn default_new_block_data_version(holes: bool) -> DataVer {
    if holes {
        FILES_WITH_HOLES_DATA_VER
    } else {
        FIRST_VALID_DATA_VER
    }
}

/// Provenance of a block reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct BlockContext {
    pub creator: UserId,
    pub writer: UserId,
    pub ref_nonce: RefNonce,
}

impl BlockContext {
    /// Context for the reference that brings a block into existence.
    pub fn first(uid: UserId) -> Self {
        Self {
            creator: uid,
            writer: uid,
            ref_nonce: ZERO_REF_NONCE,
        }
    }
}

/// Full reference to a block: which ciphertext, under which key
/// generation and data version, and which independent reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub context: BlockContext,
}

impl BlockPointer {
    pub fn is_valid(&self) -> bool {
        !self.id.is_zero()
    }

    pub fn set_writer(&mut self, uid: UserId) {
        self.context.writer = uid;
    }
}

/// The recognizable absent pointer.
pub fn zero_ptr() -> BlockPointer {
    BlockPointer::default()
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, hex::encode(self.context.ref_nonce.0))
    }
}

/// A pointer plus the size its ciphertext occupies in the block store.
/// An `encoded_size` of zero means the block is dirty (or brand new)
/// and has not been encoded yet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct BlockInfo {
    pub pointer: BlockPointer,
    pub encoded_size: u32,
}

/// One child slot of an indirect file block.  `off` is the absolute
/// byte offset of the first byte held by the pointed-to subtree.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    pub off: i64,
    pub holes: bool,
}

/// A file block: direct blocks carry bytes, indirect blocks carry an
/// offset-ordered vector of child pointers.
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileBlock {
    pub is_ind: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contents: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub iptrs: Vec<IndirectFilePtr>,
}

impl FileBlock {
    pub fn new_direct() -> Self {
        Self::default()
    }

    pub fn new_indirect() -> Self {
        Self {
            is_ind: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::File
    }
}

/// Directory entry for a file, directory or symlink.  Mutated
/// copy-on-write through the parent directory block.
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_type: EntryType,
    pub size: u64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub sym_path: String,
    pub mtime: i64,
    pub ctime: i64,
}
