/*!
The repository index and its companion hints file.

The index maps object ids to their physical location (segment number and
byte offset). It lives in memory as a hashtable and is persisted as
`index.<N>` snapshots, where `N` is the id of the last committed segment;
snapshots are replaced atomically via rename on the same filesystem, and
the index is always rebuildable from scratch by replaying the segments in
order.

The hints file records per-segment used/free byte counts and the set of
compaction candidates, accumulated as DELETE entries land.
*/
use cairn_core::repository::ChunkId;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{remove_file, rename, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error on index file")]
    IOError(#[from] std::io::Error),
    #[error("Index snapshot failed to (de)serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Index snapshot is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("No index snapshot found")]
    NoSnapshot,
}

type Result<T> = std::result::Result<T, IndexError>;

/// The physical location of an object: which segment holds its PUT entry,
/// and where in that segment the entry starts
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentDescriptor {
    pub segment: u64,
    pub offset: u64,
    /// Framed length of the PUT entry, kept for space accounting
    pub len: u32,
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    entries: Vec<(ChunkId, SegmentDescriptor)>,
}

/// In-memory object id → location map, persisted per committed transaction
#[derive(Debug, Default, Clone)]
pub struct RepositoryIndex {
    entries: HashMap<ChunkId, SegmentDescriptor>,
}

impl RepositoryIndex {
    pub fn new() -> RepositoryIndex {
        RepositoryIndex::default()
    }

    pub fn lookup(&self, id: ChunkId) -> Option<SegmentDescriptor> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Records the location of an object, returning the location it
    /// shadowed, if any
    pub fn set(&mut self, id: ChunkId, location: SegmentDescriptor) -> Option<SegmentDescriptor> {
        self.entries.insert(id, location)
    }

    /// Forgets an object, returning where it used to live
    pub fn remove(&mut self, id: ChunkId) -> Option<SegmentDescriptor> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All ids currently present, in no particular order
    pub fn ids(&self) -> HashSet<ChunkId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &SegmentDescriptor)> {
        self.entries.iter()
    }

    /// Finds the transaction id of the newest persisted snapshot
    pub fn latest_snapshot(repository: &Path) -> Option<u64> {
        latest_numbered(repository, "index")
    }

    /// Loads the snapshot written by transaction `txn`
    pub fn load(repository: &Path, txn: u64) -> Result<RepositoryIndex> {
        let file = File::open(repository.join(format!("index.{}", txn)))?;
        let snapshot: IndexSnapshot = rmp_serde::decode::from_read(file)?;
        debug!(
            "Loaded index snapshot {} with {} entries",
            txn,
            snapshot.entries.len()
        );
        Ok(RepositoryIndex {
            entries: snapshot.entries.into_iter().collect(),
        })
    }

    /// Persists the index as `index.<txn>`, atomically, and removes any
    /// older snapshots
    pub fn save(&self, repository: &Path, txn: u64) -> Result<()> {
        let snapshot = IndexSnapshot {
            version: 1,
            entries: self.entries.iter().map(|(k, v)| (*k, *v)).collect(),
        };
        write_numbered_atomic(repository, "index", txn, &snapshot)?;
        trace!("Persisted index snapshot {}", txn);
        Ok(())
    }
}

/// Byte accounting for one sealed segment
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Bytes occupied by live PUT entries
    pub used: u64,
    /// Bytes freed by deletes and shadowed puts
    pub free: u64,
}

impl SegmentStats {
    /// Whether the freed share of this segment crosses the compaction
    /// threshold (free ≥ `threshold_percent` of the total)
    pub fn wants_compaction(&self, threshold_percent: u64) -> bool {
        let total = self.used + self.free;
        total > 0 && self.free * 100 >= total * threshold_percent
    }
}

/// Per-segment space accounting plus the compaction candidate set,
/// persisted beside the index as `hints.<N>`
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Hints {
    version: u32,
    pub segments: BTreeMap<u64, SegmentStats>,
    pub compact: BTreeSet<u64>,
}

impl Hints {
    pub fn new() -> Hints {
        Hints::default()
    }

    /// Accounts for a PUT entry of `len` bytes landing in `segment`
    pub fn record_put(&mut self, segment: u64, len: u64) {
        self.segments.entry(segment).or_default().used += len;
    }

    /// Accounts for `len` bytes in `segment` going dead, marking the
    /// segment for compaction once it crosses the threshold
    pub fn record_free(&mut self, segment: u64, len: u64, threshold_percent: u64) {
        let stats = self.segments.entry(segment).or_default();
        stats.used = stats.used.saturating_sub(len);
        stats.free += len;
        if stats.wants_compaction(threshold_percent) {
            self.compact.insert(segment);
        }
    }

    /// Drops all accounting for a segment that no longer exists
    pub fn forget_segment(&mut self, segment: u64) {
        self.segments.remove(&segment);
        self.compact.remove(&segment);
    }

    pub fn latest_snapshot(repository: &Path) -> Option<u64> {
        latest_numbered(repository, "hints")
    }

    pub fn load(repository: &Path, txn: u64) -> Result<Hints> {
        let file = File::open(repository.join(format!("hints.{}", txn)))?;
        Ok(rmp_serde::decode::from_read(file)?)
    }

    pub fn save(&self, repository: &Path, txn: u64) -> Result<()> {
        write_numbered_atomic(repository, "hints", txn, self)
    }
}

/// Finds the highest N for which `<prefix>.<N>` exists in the repository
/// root
fn latest_numbered(repository: &Path, prefix: &str) -> Option<u64> {
    let mut best = None;
    let entries = std::fs::read_dir(repository).ok()?;
    for entry in entries.filter_map(std::result::Result::ok) {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let mut parts = name.splitn(2, '.');
        if parts.next() != Some(prefix) {
            continue;
        }
        if let Some(n) = parts.next().and_then(|n| n.parse::<u64>().ok()) {
            best = Some(best.map_or(n, |b: u64| b.max(n)));
        }
    }
    best
}

/// Writes `<prefix>.<txn>` via a temporary file and a same-filesystem
/// rename, then prunes older generations
fn write_numbered_atomic<V: Serialize>(
    repository: &Path,
    prefix: &str,
    txn: u64,
    value: &V,
) -> Result<()> {
    let tmp_path = repository.join(format!("{}.tmp", prefix));
    let final_path = repository.join(format!("{}.{}", prefix, txn));
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        rmp_serde::encode::write(&mut file, value)?;
        file.flush()?;
        file.sync_all()?;
    }
    rename(&tmp_path, &final_path)?;
    // Older snapshots are superseded; losing them is fine, the segments can
    // always be replayed
    for old in numbered_files(repository, prefix)
        .into_iter()
        .filter(|(n, _)| *n != txn)
    {
        let _ = remove_file(old.1);
    }
    Ok(())
}

fn numbered_files(repository: &Path, prefix: &str) -> Vec<(u64, PathBuf)> {
    let mut found = Vec::new();
    if let Ok(entries) = std::fs::read_dir(repository) {
        for entry in entries.filter_map(std::result::Result::ok) {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let mut parts = name.splitn(2, '.');
            if parts.next() != Some(prefix) {
                continue;
            }
            if let Some(n) = parts.next().and_then(|n| n.parse::<u64>().ok()) {
                found.push((n, entry.path()));
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut index = RepositoryIndex::new();
        let id = ChunkId::random_id();
        index.set(
            id,
            SegmentDescriptor {
                segment: 3,
                offset: 14,
                len: 100,
            },
        );
        index.save(dir.path(), 3).unwrap();

        assert_eq!(RepositoryIndex::latest_snapshot(dir.path()), Some(3));
        let loaded = RepositoryIndex::load(dir.path(), 3).unwrap();
        assert_eq!(
            loaded.lookup(id),
            Some(SegmentDescriptor {
                segment: 3,
                offset: 14,
                len: 100
            })
        );
    }

    #[test]
    fn newer_snapshot_supersedes_older() {
        let dir = tempdir().unwrap();
        let index = RepositoryIndex::new();
        index.save(dir.path(), 1).unwrap();
        index.save(dir.path(), 7).unwrap();
        assert_eq!(RepositoryIndex::latest_snapshot(dir.path()), Some(7));
        // The older generation is pruned
        assert!(RepositoryIndex::load(dir.path(), 1).is_err());
    }

    #[test]
    fn hints_track_compaction_candidates() {
        let mut hints = Hints::new();
        hints.record_put(0, 1000);
        assert!(hints.compact.is_empty());
        hints.record_free(0, 200, 25);
        assert!(hints.compact.is_empty());
        hints.record_free(0, 100, 25);
        assert!(hints.compact.contains(&0));
        hints.forget_segment(0);
        assert!(hints.compact.is_empty());
        assert!(hints.segments.is_empty());
    }

    #[test]
    fn hints_round_trip() {
        let dir = tempdir().unwrap();
        let mut hints = Hints::new();
        hints.record_put(2, 512);
        hints.record_free(2, 512, 25);
        hints.save(dir.path(), 2).unwrap();
        let loaded = Hints::load(dir.path(), 2).unwrap();
        assert_eq!(loaded.segments, hints.segments);
        assert_eq!(loaded.compact, hints.compact);
    }
}
