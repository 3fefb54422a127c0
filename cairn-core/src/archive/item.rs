use crate::repository::ChunkId;

use serde::{Deserialize, Serialize};

/// A single entry in a regular file's chunk list.
///
/// `size` is the plain-text length of the chunk, `csize` the stored
/// (compressed, encrypted) length; the concatenation of a file's chunk
/// plain texts in order is the file content.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: ChunkId,
    pub size: u32,
    pub csize: u32,
}

/// The filesystem object type of an item, along with any type-specific
/// payload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ItemType {
    RegularFile,
    Directory,
    Symlink { target: String },
    /// A hard link to a regular file that appeared earlier in the same
    /// archive, referenced by its stored path
    Hardlink { source: String },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
}

/// One filesystem object as recorded in an archive's item stream.
///
/// Paths are stored normalised: relative, forward-slash separated, and
/// never starting with a separator, regardless of the source OS.
///
/// Timestamps are nanoseconds since the epoch. `birthtime_ns` is recorded
/// where the filesystem provides it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub path: String,
    pub item_type: ItemType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    pub mtime_ns: i64,
    pub atime_ns: i64,
    pub ctime_ns: i64,
    pub birthtime_ns: Option<i64>,
    pub size: u64,
    /// Ordered chunk list for regular files; empty for everything else
    pub chunks: Vec<ChunkRef>,
    /// When repair has substituted all-zero replacement chunks into
    /// `chunks`, the original (healthy) list is preserved here so the item
    /// can reconverge if the missing chunks reappear.
    pub chunks_healthy: Option<Vec<ChunkRef>>,
}

impl Item {
    /// True when repair has patched this item's chunk list
    pub fn is_broken(&self) -> bool {
        self.chunks_healthy.is_some()
    }

    /// Sum of the stored sizes of this item's chunks
    pub fn csize(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.csize)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_round_trip() {
        let item = Item {
            path: "srv/data/file.txt".to_string(),
            item_type: ItemType::RegularFile,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            user: Some("operator".to_string()),
            group: None,
            mtime_ns: 1_600_000_000_000_000_123,
            atime_ns: 1_600_000_000_000_000_456,
            ctime_ns: 1_600_000_000_000_000_789,
            birthtime_ns: None,
            size: 42,
            chunks: vec![ChunkRef {
                id: ChunkId::random_id(),
                size: 42,
                csize: 40,
            }],
            chunks_healthy: None,
        };
        let bytes = rmp_serde::to_vec(&item).unwrap();
        let back: Item = rmp_serde::decode::from_read(&bytes[..]).unwrap();
        assert_eq!(item, back);
        assert!(!back.is_broken());
        assert_eq!(back.csize(), 40);
    }
}
