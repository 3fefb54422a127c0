/*!
The files index: path → (age, inode, size, timestamps, chunk ids).

A file whose size, mtime, ctime (and optionally inode) all match its cached
entry contributes its existing chunk ids to a new archive without being
read at all. Entries age by one generation per backup and are evicted once
they exceed the TTL; a suffix keeps separate indices for disjoint backup
sources sharing one repository.
*/
use super::CacheError;
use cairn_core::archive::ChunkRef;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use std::collections::HashMap;
use std::fs::{create_dir_all, rename, File};
use std::path::Path;

type Result<T> = std::result::Result<T, CacheError>;

/// Generations an untouched entry survives before eviction
pub const DEFAULT_TTL: u8 = 20;

/// What we remember about one file
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FilesIndexEntry {
    /// Backups since this entry was last hit
    pub age: u8,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub chunks: Vec<ChunkRef>,
}

#[derive(Serialize, Deserialize)]
struct FilesIndexFile {
    version: u32,
    entries: Vec<(String, FilesIndexEntry)>,
}

/// The files index for one repository (and source suffix)
#[derive(Debug)]
pub struct FilesIndex {
    entries: HashMap<String, FilesIndexEntry>,
    ttl: u8,
}

impl Default for FilesIndex {
    fn default() -> FilesIndex {
        FilesIndex {
            entries: HashMap::new(),
            ttl: DEFAULT_TTL,
        }
    }
}

impl FilesIndex {
    pub fn new(ttl: u8) -> FilesIndex {
        FilesIndex {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a file by its current metadata.
    ///
    /// A hit requires size, mtime and ctime to match, plus the inode when
    /// `consider_inode` is set. A hit resets the entry's age. The caller is
    /// responsible for confirming the referenced chunks still exist before
    /// trusting the hit.
    pub fn lookup(
        &mut self,
        path: &str,
        inode: u64,
        size: u64,
        mtime_ns: i64,
        ctime_ns: i64,
        consider_inode: bool,
    ) -> Option<&FilesIndexEntry> {
        let entry = self.entries.get_mut(path)?;
        let matches = entry.size == size
            && entry.mtime_ns == mtime_ns
            && entry.ctime_ns == ctime_ns
            && (!consider_inode || entry.inode == inode);
        if matches {
            entry.age = 0;
            trace!("Files cache hit for {}", path);
            Some(entry)
        } else {
            trace!("Files cache stale for {}", path);
            None
        }
    }

    /// Records (or replaces) the entry for a file just backed up
    pub fn memorize(
        &mut self,
        path: String,
        inode: u64,
        size: u64,
        mtime_ns: i64,
        ctime_ns: i64,
        chunks: Vec<ChunkRef>,
    ) {
        self.entries.insert(
            path,
            FilesIndexEntry {
                age: 0,
                inode,
                size,
                mtime_ns,
                ctime_ns,
                chunks,
            },
        );
    }

    /// Ages every entry by one generation and evicts the expired ones;
    /// called once per completed backup
    pub fn age_and_evict(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| {
            entry.age = entry.age.saturating_add(1);
            entry.age <= ttl
        });
    }

    fn file_name(suffix: &str) -> String {
        if suffix.is_empty() {
            "files".to_string()
        } else {
            format!("files.{}", suffix)
        }
    }

    /// Loads the persisted index, returning an empty one if absent
    pub fn load(cache_dir: &Path, suffix: &str, ttl: u8) -> Result<FilesIndex> {
        let path = cache_dir.join(Self::file_name(suffix));
        if !path.exists() {
            return Ok(FilesIndex::new(ttl));
        }
        let file: FilesIndexFile = rmp_serde::decode::from_read(File::open(path)?)?;
        debug!("Loaded files index with {} entries", file.entries.len());
        Ok(FilesIndex {
            entries: file.entries.into_iter().collect(),
            ttl,
        })
    }

    pub fn save(&self, cache_dir: &Path, suffix: &str) -> Result<()> {
        create_dir_all(cache_dir)?;
        let file = FilesIndexFile {
            version: 1,
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let tmp = cache_dir.join(format!("{}.tmp", Self::file_name(suffix)));
        {
            let mut handle = File::create(&tmp)?;
            rmp_serde::encode::write(&mut handle, &file)?;
            handle.sync_all()?;
        }
        rename(tmp, cache_dir.join(Self::file_name(suffix)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::repository::ChunkId;
    use tempfile::tempdir;

    fn sample_chunks() -> Vec<ChunkRef> {
        vec![ChunkRef {
            id: ChunkId::random_id(),
            size: 10,
            csize: 8,
        }]
    }

    #[test]
    fn hit_requires_matching_metadata() {
        let mut index = FilesIndex::new(2);
        index.memorize("src/a".to_string(), 7, 100, 1111, 2222, sample_chunks());

        assert!(index.lookup("src/a", 7, 100, 1111, 2222, true).is_some());
        // Changed mtime misses
        assert!(index.lookup("src/a", 7, 100, 9999, 2222, true).is_none());
        // Changed inode misses only when inodes are considered
        assert!(index.lookup("src/a", 8, 100, 1111, 2222, true).is_none());
        assert!(index.lookup("src/a", 8, 100, 1111, 2222, false).is_some());
        // Unknown path misses
        assert!(index.lookup("src/b", 7, 100, 1111, 2222, true).is_none());
    }

    #[test]
    fn entries_age_out_after_ttl() {
        let mut index = FilesIndex::new(2);
        index.memorize("src/a".to_string(), 1, 1, 1, 1, sample_chunks());

        index.age_and_evict();
        index.age_and_evict();
        assert_eq!(index.len(), 1);
        index.age_and_evict();
        assert!(index.is_empty());
    }

    #[test]
    fn a_hit_resets_the_age() {
        let mut index = FilesIndex::new(2);
        index.memorize("src/a".to_string(), 1, 1, 1, 1, sample_chunks());
        index.age_and_evict();
        index.age_and_evict();
        assert!(index.lookup("src/a", 1, 1, 1, 1, true).is_some());
        index.age_and_evict();
        index.age_and_evict();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn suffixes_keep_separate_indices() {
        let dir = tempdir().unwrap();
        let mut index_a = FilesIndex::new(DEFAULT_TTL);
        index_a.memorize("only/in/a".to_string(), 1, 1, 1, 1, sample_chunks());
        index_a.save(dir.path(), "").unwrap();
        let index_b = FilesIndex::new(DEFAULT_TTL);
        index_b.save(dir.path(), "srv").unwrap();

        let loaded_a = FilesIndex::load(dir.path(), "", DEFAULT_TTL).unwrap();
        let loaded_b = FilesIndex::load(dir.path(), "srv", DEFAULT_TTL).unwrap();
        assert_eq!(loaded_a.len(), 1);
        assert!(loaded_b.is_empty());
    }
}
