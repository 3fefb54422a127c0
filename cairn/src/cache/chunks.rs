/*!
The chunks index: id → (refcount, size, stored size).

Authoritative for the client's local decision "does this chunk already
exist in the repository". The refcount equals the number of references
from all archives in the manifest, plus ephemeral references held by an
in-flight archive; a chunk whose refcount drops to zero is deleted from
the repository at the next commit.

The cache is persisted with the stamp of the manifest it was synchronised
against. When the stamp no longer matches (another client wrote the
repository), the index is rebuilt by merging per-archive chunk reference
sets, which are themselves cached so only new archives require reading
item streams.
*/
use super::CacheError;
use crate::archive::ItemStreamReader;
use crate::manifest::Manifest;
use crate::repository::Repository;
use cairn_core::archive::ChunkRef;
use cairn_core::repository::ChunkId;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use std::collections::{HashMap, HashSet};
use std::fs::{create_dir_all, remove_file, rename, File};
use std::path::{Path, PathBuf};

type Result<T> = std::result::Result<T, CacheError>;

/// Per-chunk bookkeeping
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkIndexEntry {
    pub refcount: u32,
    pub size: u32,
    pub csize: u32,
}

#[derive(Serialize, Deserialize)]
struct ChunkIndexFile {
    version: u32,
    /// Stamp of the manifest this cache reflects
    manifest_stamp: Vec<u8>,
    entries: Vec<(ChunkId, ChunkIndexEntry)>,
}

/// The in-memory chunks index for one repository
#[derive(Debug, Default)]
pub struct ChunkIndex {
    manifest_stamp: Vec<u8>,
    entries: HashMap<ChunkId, ChunkIndexEntry>,
}

impl ChunkIndex {
    pub fn new() -> ChunkIndex {
        ChunkIndex::default()
    }

    /// Returns the entry for a chunk when it is known locally
    pub fn get(&self, id: ChunkId) -> Option<ChunkIndexEntry> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a fresh chunk with refcount one
    pub fn insert(&mut self, id: ChunkId, size: u32, csize: u32) {
        self.entries.insert(
            id,
            ChunkIndexEntry {
                refcount: 1,
                size,
                csize,
            },
        );
    }

    /// Increments a chunk's refcount, returning its entry.
    ///
    /// Panics when the chunk is unknown; callers check first via `get`.
    pub fn add_ref(&mut self, id: ChunkId) -> ChunkIndexEntry {
        let entry = self
            .entries
            .get_mut(&id)
            .expect("add_ref on a chunk the index does not know");
        entry.refcount = entry.refcount.saturating_add(1);
        *entry
    }

    /// Decrements a chunk's refcount, removing and returning `true` when it
    /// reached zero (the caller then deletes the object from the
    /// repository)
    pub fn del_ref(&mut self, id: ChunkId) -> bool {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                self.entries.remove(&id);
                return true;
            }
        }
        false
    }

    /// The stamp of the manifest this index was last synchronised with
    pub fn manifest_stamp(&self) -> &[u8] {
        &self.manifest_stamp
    }

    pub fn set_manifest_stamp(&mut self, stamp: Vec<u8>) {
        self.manifest_stamp = stamp;
    }

    /// Loads the persisted index, returning an empty one if absent
    pub fn load(cache_dir: &Path) -> Result<ChunkIndex> {
        let path = cache_dir.join("chunks");
        if !path.exists() {
            return Ok(ChunkIndex::new());
        }
        let file: ChunkIndexFile = rmp_serde::decode::from_read(File::open(path)?)?;
        debug!("Loaded chunks index with {} entries", file.entries.len());
        Ok(ChunkIndex {
            manifest_stamp: file.manifest_stamp,
            entries: file.entries.into_iter().collect(),
        })
    }

    pub fn save(&self, cache_dir: &Path) -> Result<()> {
        create_dir_all(cache_dir)?;
        let file = ChunkIndexFile {
            version: 1,
            manifest_stamp: self.manifest_stamp.clone(),
            entries: self.entries.iter().map(|(k, v)| (*k, *v)).collect(),
        };
        let tmp = cache_dir.join("chunks.tmp");
        {
            let mut handle = File::create(&tmp)?;
            rmp_serde::encode::write(&mut handle, &file)?;
            handle.sync_all()?;
        }
        rename(tmp, cache_dir.join("chunks"))?;
        trace!("Persisted chunks index ({} entries)", self.entries.len());
        Ok(())
    }

    /// Brings the index in sync with the given manifest, if it is not
    /// already.
    ///
    /// Refcounts are rebuilt by summing each archive's chunk references.
    /// Per-archive reference sets are cached on disk, so only archives this
    /// client has never seen require reading their item streams from the
    /// repository.
    pub fn resync(
        &mut self,
        repo: &mut Repository,
        manifest: &Manifest,
        cache_dir: &Path,
    ) -> Result<()> {
        let stamp = manifest.stamp();
        if self.manifest_stamp == stamp {
            return Ok(());
        }
        info!("Chunks index is stale, resynchronising against the manifest");
        create_dir_all(cache_dir)?;
        self.entries.clear();

        let mut wanted_sets: HashSet<PathBuf> = HashSet::new();
        for entry in manifest.archives() {
            let set_path = cache_dir.join(format!("archive.{}", entry.id));
            let refs: Vec<ChunkRef> = if set_path.exists() {
                rmp_serde::decode::from_read(File::open(&set_path)?)?
            } else {
                let refs = archive_chunk_refs(repo, entry.id)?;
                let tmp = set_path.with_extension("tmp");
                {
                    let mut handle = File::create(&tmp)?;
                    rmp_serde::encode::write(&mut handle, &refs)?;
                }
                rename(&tmp, &set_path)?;
                refs
            };
            wanted_sets.insert(set_path);
            for chunk in refs {
                self.entries
                    .entry(chunk.id)
                    .and_modify(|e| e.refcount = e.refcount.saturating_add(1))
                    .or_insert(ChunkIndexEntry {
                        refcount: 1,
                        size: chunk.size,
                        csize: chunk.csize,
                    });
            }
        }

        // Drop reference sets for archives that no longer exist
        if let Ok(dir) = std::fs::read_dir(cache_dir) {
            for entry in dir.filter_map(std::result::Result::ok) {
                let path = entry.path();
                let is_set = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("archive."));
                if is_set && !wanted_sets.contains(&path) {
                    let _ = remove_file(path);
                }
            }
        }

        self.manifest_stamp = stamp;
        self.save(cache_dir)?;
        Ok(())
    }
}

/// Collects every chunk reference an archive holds: its data chunks, its
/// item-stream chunks, and the archive metadata object itself
fn archive_chunk_refs(repo: &mut Repository, id: ChunkId) -> Result<Vec<ChunkRef>> {
    let record = crate::archive::load_archive_record(repo, id)?;
    let mut refs = Vec::new();
    let archive_chunk = repo.get_chunk(id)?;
    refs.push(ChunkRef {
        id,
        size: 0,
        csize: archive_chunk.csize() as u32,
    });
    for meta_id in &record.item_stream {
        let meta_chunk = repo.get_chunk(*meta_id)?;
        refs.push(ChunkRef {
            id: *meta_id,
            size: 0,
            csize: meta_chunk.csize() as u32,
        });
    }
    let mut items = ItemStreamReader::new(record.item_stream.clone());
    while let Some(item) = items.next_item(repo)? {
        refs.extend(item.chunks.iter().copied());
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn refcounting_lifecycle() {
        let mut index = ChunkIndex::new();
        let id = ChunkId::random_id();
        assert!(index.get(id).is_none());

        index.insert(id, 100, 60);
        assert_eq!(index.get(id).unwrap().refcount, 1);

        let entry = index.add_ref(id);
        assert_eq!(entry.refcount, 2);
        assert_eq!(entry.size, 100);

        assert!(!index.del_ref(id));
        // Second deref hits zero and removes the entry
        assert!(index.del_ref(id));
        assert!(index.get(id).is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut index = ChunkIndex::new();
        let id = ChunkId::random_id();
        index.insert(id, 10, 8);
        index.set_manifest_stamp(vec![1, 2, 3]);
        index.save(dir.path()).unwrap();

        let loaded = ChunkIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.get(id), index.get(id));
        assert_eq!(loaded.manifest_stamp(), &[1, 2, 3]);
    }

    #[test]
    fn missing_cache_loads_empty() {
        let dir = tempdir().unwrap();
        let index = ChunkIndex::load(dir.path()).unwrap();
        assert!(index.is_empty());
        assert!(index.manifest_stamp().is_empty());
    }
}
