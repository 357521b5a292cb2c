use crate::{BlockPointer, FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a top-level folder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct TlfId(pub u64);

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tlf:{:x}", self.0)
    }
}

/// Name of a branch of a folder's revision history.  The empty name is
/// the master (server-blessed) branch; devices that diverge work on a
/// named unmerged branch until resolution.
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct BranchName(pub String);

pub fn master_branch() -> BranchName {
    BranchName(String::new())
}

impl BranchName {
    pub fn is_master(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_master() {
            write!(f, "master")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A (folder, branch) pair naming one revision chain.
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug, Serialize, Deserialize)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: BranchName,
}

/// Monotonically increasing revision number within a folder branch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Debug, Serialize, Deserialize)]
pub struct MetadataRevision(pub u64);

/// Sentinel for "no revision observed yet".
pub const REVISION_UNINITIALIZED: MetadataRevision = MetadataRevision(0);

impl MetadataRevision {
    pub fn next(self) -> MetadataRevision {
        MetadataRevision(self.0 + 1)
    }
}

impl fmt::Display for MetadataRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev{}", self.0)
    }
}

/// One step in a path: the named entry and the block it points to.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

/// An absolute path within one folder branch, from the root block down
/// to the node in question.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct Path {
    pub folder_branch: FolderBranch,
    pub nodes: Vec<PathNode>,
}

impl Path {
    pub fn new(folder_branch: FolderBranch, nodes: Vec<PathNode>) -> Self {
        Self {
            folder_branch,
            nodes,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn has_valid_parent(&self) -> bool {
        self.nodes.len() > 1
    }

    /// The block pointer of the node this path names.
    pub fn tail_pointer(&self) -> BlockPointer {
        self.nodes.last().map(|n| n.ptr).unwrap_or_default()
    }

    pub fn tail_name(&self) -> &str {
        self.nodes.last().map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn parent_path(&self) -> FsResult<Path> {
        if !self.has_valid_parent() {
            return Err(FsError::BadPath(self.to_string()));
        }
        Ok(Path {
            folder_branch: self.folder_branch.clone(),
            nodes: self.nodes[..self.nodes.len() - 1].to_vec(),
        })
    }

    /// Extend this path one level down.
    pub fn child_path(&self, name: &str, ptr: BlockPointer) -> Path {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode {
            ptr,
            name: name.to_string(),
        });
        Path {
            folder_branch: self.folder_branch.clone(),
            nodes,
        }
    }

    pub fn depth(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        write!(f, "{}", names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(seed: u8) -> BlockPointer {
        let mut p = BlockPointer::default();
        p.id.0[0] = seed;
        p
    }

    fn sample_path() -> Path {
        Path::new(
            FolderBranch::default(),
            vec![
                PathNode {
                    ptr: ptr(1),
                    name: "tlf".to_string(),
                },
                PathNode {
                    ptr: ptr(2),
                    name: "a".to_string(),
                },
                PathNode {
                    ptr: ptr(3),
                    name: "b".to_string(),
                },
            ],
        )
    }

    #[test]
    fn test_tail_and_parent() {
        let p = sample_path();
        assert_eq!(p.tail_pointer(), ptr(3));
        assert_eq!(p.tail_name(), "b");
        let parent = p.parent_path().unwrap();
        assert_eq!(parent.tail_pointer(), ptr(2));
        assert_eq!(parent.depth(), 2);
        assert_eq!(p.to_string(), "tlf/a/b");
    }

    #[test]
    fn test_parent_of_root_is_error() {
        let root = Path::new(
            FolderBranch::default(),
            vec![PathNode {
                ptr: ptr(1),
                name: "tlf".to_string(),
            }],
        );
        assert!(root.parent_path().is_err());
        assert!(!root.has_valid_parent());
    }
}
