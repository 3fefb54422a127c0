/*!
The repository implements a low-level, content-addressed key-value store
upon which all higher level structures in cairn are built.

Objects are compressed, encrypted, MAC-tagged blobs addressed by a keyed
hash of their plain text (with the exception of the manifest, which lives
at a fixed all-zero id). Storage is an append-only log of numbered segment
files; an in-memory index backed by persistent snapshots maps each id to
its physical location.

# Transactions

Writes are buffered into the currently open segment. `commit` writes a
COMMIT entry, fsyncs the segment, atomically replaces the persistent index
and hints snapshots, and rotates to a new segment. A segment that does not
end in a COMMIT is uncommitted; opening the repository rolls it back, so a
crash mid-transaction is indistinguishable from the transaction never
having happened.

# Deduplication

A chunk whose id already exists in the index is never written twice. As
ids are keyed hashes of the plain text, equal ids mean equal content
within the limits of reason.
*/
use crate::config::EngineConfig;
use cairn_core::repository::{
    Chunk, ChunkError, ChunkId, ChunkSettings, Encryption, Key, ObjectKind,
};

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use std::collections::HashSet;
use std::fs::{create_dir_all, remove_file, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub mod check;
pub mod config;
pub mod files;
pub mod index;
pub mod keys;
pub mod lock;
pub mod nonce;
pub mod security;
pub mod segment;

pub use check::{CheckOptions, CheckReport};
pub use config::RepoConfig;
pub use index::{Hints, RepositoryIndex, SegmentDescriptor};
pub use keys::KeyMode;
pub use lock::{ExclusiveLock, SharedLock};
pub use nonce::NonceStore;
pub use security::SecurityCache;
pub use segment::{SegmentEntry, SegmentReader, SegmentWriter};

/// Error for everything that can go wrong operating a repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("I/O error")]
    IOError(#[from] std::io::Error),
    #[error("Segment error")]
    Segment(#[from] segment::SegmentError),
    #[error("Index error")]
    Index(#[from] index::IndexError),
    #[error("Repository config error")]
    Config(#[from] config::ConfigError),
    #[error("Lock error")]
    Lock(#[from] lock::LockError),
    #[error("Nonce counter error")]
    Nonce(#[from] nonce::NonceError),
    #[error("Key error")]
    Key(#[from] keys::KeyManagerError),
    #[error("Security check failed")]
    Security(#[from] security::SecurityError),
    #[error("Object envelope error")]
    Chunk(#[from] ChunkError),
    #[error("Object serialization failed")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Object is corrupt on disk: {id}: {reason}")]
    ObjectCorrupt { id: ChunkId, reason: String },
    #[error("Missing object: {0}")]
    ObjectMissing(ChunkId),
    #[error("Repository is open read-only")]
    ReadOnly,
    #[error("{0}")]
    Usage(String),
    #[error("Repository path {0} already contains something")]
    AlreadyExists(PathBuf),
}

type Result<T> = std::result::Result<T, RepositoryError>;

/// Outcome of a compaction run
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionReport {
    pub segments_compacted: usize,
    pub bytes_reclaimed: u64,
}

#[derive(Debug)]
enum LockGuard {
    Exclusive(ExclusiveLock),
    Shared(SharedLock),
}

/// A handle to an open repository.
///
/// Holds the repository lock for its lifetime: exclusive when opened
/// writable, shared otherwise. All I/O is synchronous and happens on the
/// caller's thread.
pub struct Repository {
    path: PathBuf,
    pub config: RepoConfig,
    key: Key,
    key_mode: KeyMode,
    index: RepositoryIndex,
    hints: Hints,
    nonces: Option<NonceStore>,
    /// Locally reserved, not yet used nonce range
    nonce_block: (u64, u64),
    writer: Option<SegmentWriter>,
    writer_segment: u64,
    /// Segment id of the last durable commit; index/hints snapshots carry
    /// this number
    txn_segment: u64,
    readers: LruCache<u64, SegmentReader<File>>,
    writable: bool,
    _lock: LockGuard,
}

impl Repository {
    /// Creates a new repository at `path` and opens it writable.
    ///
    /// The directory must not exist or must be empty. Key material is
    /// generated according to `key_mode` and wrapped with `passphrase`.
    #[instrument(skip(engine, passphrase))]
    pub fn init(
        path: &Path,
        engine: &EngineConfig,
        key_mode: KeyMode,
        settings: ChunkSettings,
        passphrase: &[u8],
        tam_required: bool,
    ) -> Result<Repository> {
        if path.exists() && path.read_dir()?.next().is_some() {
            return Err(RepositoryError::AlreadyExists(path.to_path_buf()));
        }
        create_dir_all(path)?;
        create_dir_all(path.join("data"))?;

        let mut config = RepoConfig::new(settings, tam_required);
        let key = keys::create_key(key_mode, &mut config, engine, settings.encryption, passphrase)?;
        config.save(path)?;
        RepoConfig::write_readme(path)?;

        // A repository we just created is, by definition, known to us
        let security = SecurityCache::open(&engine.security_dir, &config.id.to_string())?;
        security.check_and_update(&path.to_string_lossy(), key_mode, true, true)?;

        // Empty baseline snapshots, so open always finds a transaction to
        // start from
        RepositoryIndex::new().save(path, 0)?;
        Hints::new().save(path, 0)?;

        info!("Initialized repository {} at {:?}", config.id, path);
        Repository::open(path, engine, Some(passphrase), true)
    }

    /// Opens an existing repository.
    ///
    /// `writable` selects the exclusive lock and enables mutation;
    /// otherwise a shared lock is taken and only reads are allowed. Any
    /// uncommitted tail left by a crashed writer is rolled back here (on
    /// disk only when writable).
    #[instrument(skip(engine, passphrase))]
    pub fn open(
        path: &Path,
        engine: &EngineConfig,
        passphrase: Option<&[u8]>,
        writable: bool,
    ) -> Result<Repository> {
        let config = RepoConfig::load(path)?;
        let (key_mode, key) = keys::load_key(&config, engine, passphrase)?;

        let security = SecurityCache::open(&engine.security_dir, &config.id.to_string())?;
        security.check_and_update(
            &path.to_string_lossy(),
            key_mode,
            engine.allow_relocated_repo,
            engine.allow_unencrypted_access,
        )?;

        let host_id = lock::host_id(
            &engine.node_id().map_err(|_| {
                RepositoryError::IOError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "unable to determine node id",
                ))
            })?,
            engine.host_id_override.as_deref(),
        );
        let guard = if writable {
            LockGuard::Exclusive(ExclusiveLock::acquire(path, &host_id)?)
        } else {
            LockGuard::Shared(SharedLock::acquire(path, &host_id)?)
        };

        let snapshot = RepositoryIndex::latest_snapshot(path).unwrap_or(0);
        let index = RepositoryIndex::load(path, snapshot).unwrap_or_default();
        let hints = Hints::load(path, snapshot).unwrap_or_default();

        let nonces = if writable && config.settings.encryption != Encryption::NoEncryption {
            let mut store = NonceStore::open(&engine.security_dir, &config.id.to_string())?;
            store.reconcile(read_repo_nonce(path))?;
            Some(store)
        } else {
            None
        };

        let mut repo = Repository {
            path: path.to_path_buf(),
            config,
            key,
            key_mode,
            index,
            hints,
            nonces,
            nonce_block: (0, 0),
            writer: None,
            writer_segment: 0,
            txn_segment: snapshot,
            readers: LruCache::new(100),
            writable,
            _lock: guard,
        };
        repo.replay()?;
        Ok(repo)
    }

    /// Opens a repository for serving storage operations to a remote
    /// client.
    ///
    /// The key stays unknown: objects pass through as opaque envelopes and
    /// are never unpacked here. Security state and nonce management are
    /// the client's business; the client ships its nonce high-water mark
    /// with each commit.
    pub fn open_serving(
        path: &Path,
        engine: &EngineConfig,
        writable: bool,
    ) -> Result<Repository> {
        let config = RepoConfig::load(path)?;
        let host_id = lock::host_id(
            &engine.node_id().map_err(|_| {
                RepositoryError::IOError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "unable to determine node id",
                ))
            })?,
            engine.host_id_override.as_deref(),
        );
        let guard = if writable {
            LockGuard::Exclusive(ExclusiveLock::acquire(path, &host_id)?)
        } else {
            LockGuard::Shared(SharedLock::acquire(path, &host_id)?)
        };
        let snapshot = RepositoryIndex::latest_snapshot(path).unwrap_or(0);
        let index = RepositoryIndex::load(path, snapshot).unwrap_or_default();
        let hints = Hints::load(path, snapshot).unwrap_or_default();
        let key_mode = if config.key.is_some() {
            KeyMode::Repokey
        } else {
            KeyMode::None
        };
        let mut repo = Repository {
            path: path.to_path_buf(),
            config,
            key: Key::blank(),
            key_mode,
            index,
            hints,
            nonces: None,
            nonce_block: (0, 0),
            writer: None,
            writer_segment: 0,
            txn_segment: snapshot,
            readers: LruCache::new(100),
            writable,
            _lock: guard,
        };
        repo.replay()?;
        Ok(repo)
    }

    /// Records a client-supplied nonce high-water mark, for repositories
    /// written through the serving interface
    pub fn record_nonce_high_water(&mut self, value: u64) -> Result<()> {
        self.ensure_writable()?;
        let current = read_repo_nonce(&self.path).unwrap_or(0);
        if value > current {
            write_repo_nonce(&self.path, value)?;
        }
        Ok(())
    }

    /// Replays committed segments newer than the loaded snapshot into the
    /// in-memory index, and rolls back any uncommitted tail.
    ///
    /// Entries are only applied up to the last COMMIT in each segment; a
    /// segment with no trailing COMMIT (and everything after it) belongs to
    /// a transaction that never completed and is removed when writable.
    fn replay(&mut self) -> Result<()> {
        let data_dir = self.path.join("data");
        let snapshot = self.txn_segment;
        let segments: Vec<u64> = segment::all_segments(&data_dir)
            .into_iter()
            .filter(|s| *s > snapshot)
            .collect();
        let mut rolled_back: Vec<u64> = Vec::new();
        let mut replayed_to = snapshot;

        for (position, seg) in segments.iter().copied().enumerate() {
            let seg_path = segment::segment_path(&data_dir, seg, self.config.segments_per_directory);
            let mut reader = SegmentReader::open(File::open(&seg_path)?)?;
            // Entries become real only when a COMMIT follows them
            let mut pending: Vec<(u64, SegmentEntry)> = Vec::new();
            let mut committed: Vec<(u64, SegmentEntry)> = Vec::new();
            let outcome = reader.scan_entries(|offset, entry| {
                if entry.tag == segment::EntryTag::Commit {
                    committed.append(&mut pending);
                } else {
                    pending.push((offset, entry));
                }
                Ok(())
            })?;
            for (offset, entry) in committed {
                self.apply_entry(seg, offset, &entry);
            }
            let sealed = outcome.corruption.is_none()
                && outcome.last_commit_end == Some(outcome.end_offset);
            if sealed {
                replayed_to = seg;
                continue;
            }
            // This segment is the in-flight transaction's tail; it and
            // anything after it rolls back
            debug!("Rolling back uncommitted tail in segment {}", seg);
            rolled_back.push(seg);
            rolled_back.extend(&segments[position + 1..]);
            break;
        }

        if self.writable {
            for seg in &rolled_back {
                let seg_path =
                    segment::segment_path(&data_dir, *seg, self.config.segments_per_directory);
                match segment::last_commit_end(&seg_path)? {
                    Some(end) if end > segment::HEADER_SIZE => {
                        segment::truncate_segment(&seg_path, end)?
                    }
                    _ => {
                        warn!("Removing uncommitted segment {}", seg);
                        remove_file(&seg_path)?;
                        self.hints.forget_segment(*seg);
                    }
                }
            }
            if replayed_to > self.txn_segment {
                // Persist the recovered state so the next open replays less
                self.index.save(&self.path, replayed_to)?;
                self.hints.save(&self.path, replayed_to)?;
            }
        }
        self.txn_segment = replayed_to.max(self.txn_segment);
        Ok(())
    }

    fn apply_entry(&mut self, seg: u64, offset: u64, entry: &SegmentEntry) {
        let threshold = self.config.compaction_threshold_percent;
        match entry.tag {
            segment::EntryTag::Put => {
                let id = entry.id.expect("put entry always carries an id");
                let location = SegmentDescriptor {
                    segment: seg,
                    offset,
                    len: entry.framed_len(),
                };
                self.hints.record_put(seg, u64::from(location.len));
                if let Some(old) = self.index.set(id, location) {
                    self.hints
                        .record_free(old.segment, u64::from(old.len), threshold);
                }
            }
            segment::EntryTag::Delete => {
                let id = entry.id.expect("delete entry always carries an id");
                if let Some(old) = self.index.remove(id) {
                    self.hints
                        .record_free(old.segment, u64::from(old.len), threshold);
                }
            }
            segment::EntryTag::Commit => {}
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(RepositoryError::ReadOnly)
        }
    }

    /// Reserves the next encryption nonce, batching counter persistence.
    ///
    /// The persisted counter is always ahead of every nonce handed out, so
    /// a crash wastes at most a block of nonces and never reuses one.
    fn reserve_nonce(&mut self) -> Result<u64> {
        const NONCE_BATCH: u64 = 1024;
        if self.nonce_block.0 == self.nonce_block.1 {
            let store = self
                .nonces
                .as_mut()
                .expect("nonce reservation on a repository without encryption");
            let start = store.reserve(NONCE_BATCH)?;
            self.nonce_block = (start, start + NONCE_BATCH);
        }
        let nonce = self.nonce_block.0;
        self.nonce_block.0 += 1;
        Ok(nonce)
    }

    /// Packs plain text into an object envelope using the repository's
    /// settings, drawing a fresh nonce when encryption is on
    pub fn pack(&mut self, data: &[u8], kind: ObjectKind) -> Result<Chunk> {
        let settings = self.config.settings;
        let encryption = match settings.encryption {
            Encryption::NoEncryption => Encryption::NoEncryption,
            template => template.with_counter(self.reserve_nonce()?),
        };
        Ok(Chunk::pack(
            data,
            kind,
            settings.compression,
            encryption,
            settings.hmac,
            &self.key,
        ))
    }

    /// Computes the id the repository would assign to this plain text
    pub fn id_of(&self, data: &[u8]) -> ChunkId {
        ChunkId::compute(data, self.config.settings.hmac, &self.key)
    }

    /// Writes plain text as an object, deduplicating against the index.
    ///
    /// Returns `(id, already_present, stored_size)`; when the object
    /// already existed nothing is written and `stored_size` is zero.
    #[instrument(skip(self, data))]
    pub fn put_data(&mut self, data: &[u8], kind: ObjectKind) -> Result<(ChunkId, bool, u32)> {
        let id = self.id_of(data);
        if self.index.contains(id) {
            trace!("Object {} already present, doing nothing", id);
            return Ok((id, true, 0));
        }
        let chunk = self.pack(data, kind)?;
        let csize = self.put_chunk(&chunk)?;
        Ok((id, false, csize))
    }

    /// Writes an already-packed object envelope unconditionally.
    ///
    /// Returns the stored (framed payload) size in bytes.
    pub fn put_chunk(&mut self, chunk: &Chunk) -> Result<u32> {
        self.ensure_writable()?;
        let id = chunk.get_id();
        let payload = rmp_serde::to_vec(chunk)?;
        let entry = SegmentEntry::put(id, payload);
        let len = entry.framed_len();
        let seg = self.writer_for(u64::from(len))?;
        let offset = self.writer.as_mut().unwrap().append(&entry)?;
        let location = SegmentDescriptor {
            segment: seg,
            offset,
            len,
        };
        self.hints.record_put(seg, u64::from(len));
        let threshold = self.config.compaction_threshold_percent;
        if let Some(old) = self.index.set(id, location) {
            self.hints
                .record_free(old.segment, u64::from(old.len), threshold);
        }
        trace!("Stored object {} at segment {} offset {}", id, seg, offset);
        Ok(len)
    }

    /// Writes the manifest object at its fixed id, replacing any previous
    /// manifest
    pub fn put_manifest_bytes(&mut self, data: &[u8]) -> Result<()> {
        let chunk = {
            let settings = self.config.settings;
            let encryption = match settings.encryption {
                Encryption::NoEncryption => Encryption::NoEncryption,
                template => template.with_counter(self.reserve_nonce()?),
            };
            Chunk::pack_with_id(
                data,
                ObjectKind::Manifest,
                settings.compression,
                encryption,
                settings.hmac,
                &self.key,
                ChunkId::manifest_id(),
            )
        };
        self.put_chunk(&chunk)?;
        Ok(())
    }

    /// Determines if an object exists in the index
    pub fn contains(&self, id: ChunkId) -> bool {
        self.index.contains(id)
    }

    /// Number of objects currently indexed
    pub fn count_chunks(&self) -> usize {
        self.index.len()
    }

    /// All indexed ids
    pub fn list(&self) -> HashSet<ChunkId> {
        self.index.ids()
    }

    /// Reads an object envelope from storage.
    ///
    /// The framed entry id and the envelope's own id must both match the
    /// request; a mismatch means the index or the segment is corrupt.
    #[instrument(skip(self))]
    pub fn get_chunk(&mut self, id: ChunkId) -> Result<Chunk> {
        let location = self
            .index
            .lookup(id)
            .ok_or(RepositoryError::ObjectMissing(id))?;
        // Readers within a transaction observe their own writes
        if self.writer.is_some() && self.writer_segment == location.segment {
            self.writer.as_mut().unwrap().flush()?;
        }
        let corrupt = |reason: &str| RepositoryError::ObjectCorrupt {
            id,
            reason: reason.to_string(),
        };
        let entry = self.entry_at(location)?;
        if entry.tag != segment::EntryTag::Put {
            return Err(corrupt("index points at a non-put entry"));
        }
        if entry.id != Some(id) {
            return Err(corrupt("replayed entry id does not match"));
        }
        let payload = entry.payload.expect("put entry always carries a payload");
        let chunk: Chunk = rmp_serde::decode::from_read(&payload[..])
            .map_err(|err| corrupt(&format!("envelope failed to parse: {}", err)))?;
        if chunk.get_id() != id {
            return Err(corrupt("envelope id does not match"));
        }
        Ok(chunk)
    }

    /// Reads and unpacks an object, verifying MAC and id
    pub fn get_data(&mut self, id: ChunkId) -> Result<(ObjectKind, Vec<u8>)> {
        let chunk = self.get_chunk(id)?;
        Ok(chunk.unpack(&self.key)?)
    }

    fn entry_at(&mut self, location: SegmentDescriptor) -> Result<SegmentEntry> {
        let data_dir = self.path.join("data");
        if !self.readers.contains(&location.segment) {
            let seg_path = segment::segment_path(
                &data_dir,
                location.segment,
                self.config.segments_per_directory,
            );
            let reader = SegmentReader::open(File::open(&seg_path)?)?;
            self.readers.put(location.segment, reader);
        }
        let reader = self.readers.get_mut(&location.segment).unwrap();
        Ok(reader.entry_at(location.offset)?)
    }

    /// Issues a DELETE entry for an object and drops it from the index.
    ///
    /// The object's bytes are reclaimed later, when compaction rewrites the
    /// segment that holds them.
    #[instrument(skip(self))]
    pub fn delete(&mut self, id: ChunkId) -> Result<()> {
        self.ensure_writable()?;
        let old = self
            .index
            .lookup(id)
            .ok_or(RepositoryError::ObjectMissing(id))?;
        let entry = SegmentEntry::delete(id);
        let seg = self.writer_for(u64::from(entry.framed_len()))?;
        self.writer.as_mut().unwrap().append(&entry)?;
        self.index.remove(id);
        let threshold = self.config.compaction_threshold_percent;
        self.hints
            .record_free(old.segment, u64::from(old.len), threshold);
        // The delete entry itself occupies space in the new segment
        self.hints
            .record_put(seg, u64::from(entry.framed_len()));
        Ok(())
    }

    /// Returns the id of the segment the next entry will land in, sealing
    /// and rotating the current segment if `entry_len` would overflow it
    fn writer_for(&mut self, entry_len: u64) -> Result<u64> {
        if let Some(writer) = self.writer.as_ref() {
            if writer.size() + entry_len <= self.config.max_segment_size
                || writer.size() <= segment::HEADER_SIZE
            {
                return Ok(self.writer_segment);
            }
        }
        if let Some(mut writer) = self.writer.take() {
            // Seal the full segment; its entries stay part of the larger
            // logical transaction, which only becomes visible at the
            // manifest swap
            writer.commit()?;
        }
        let data_dir = self.path.join("data");
        let next = segment::highest_segment(&data_dir).max(self.txn_segment) + 1;
        let seg_path =
            segment::segment_path_create(&data_dir, next, self.config.segments_per_directory)?;
        self.writer = Some(SegmentWriter::create(&seg_path)?);
        self.writer_segment = next;
        debug!("Opened segment {} for writing", next);
        Ok(next)
    }

    /// Commits the current transaction: COMMIT entry, fsync, snapshot swap,
    /// segment rotation.
    ///
    /// A commit with no preceding writes is a no-op.
    #[instrument(skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let mut writer = match self.writer.take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        writer.commit()?;
        drop(writer);
        self.txn_segment = self.writer_segment;
        if let Some(store) = &self.nonces {
            write_repo_nonce(&self.path, store.peek())?;
        }
        self.index.save(&self.path, self.txn_segment)?;
        self.hints.save(&self.path, self.txn_segment)?;
        debug!("Committed transaction at segment {}", self.txn_segment);
        Ok(())
    }

    /// Discards everything written since the last commit and restores the
    /// in-memory state from the persistent snapshots
    #[instrument(skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.writer = None;
        let snapshot = RepositoryIndex::latest_snapshot(&self.path).unwrap_or(0);
        self.index = RepositoryIndex::load(&self.path, snapshot).unwrap_or_default();
        self.hints = Hints::load(&self.path, snapshot).unwrap_or_default();
        self.txn_segment = snapshot;
        self.readers = LruCache::new(100);
        self.replay()?;
        info!("Rolled back to transaction {}", self.txn_segment);
        Ok(())
    }

    /// Rewrites segments whose free share crossed the threshold, copying
    /// live entries into the current segment and unlinking the originals
    /// after the next commit
    #[instrument(skip(self))]
    pub fn compact(&mut self) -> Result<CompactionReport> {
        self.ensure_writable()?;
        let candidates: Vec<u64> = self
            .hints
            .compact
            .iter()
            .copied()
            .filter(|seg| *seg <= self.txn_segment)
            .collect();
        if candidates.is_empty() {
            return Ok(CompactionReport::default());
        }
        let data_dir = self.path.join("data");
        let mut report = CompactionReport::default();

        for seg in &candidates {
            let seg_path =
                segment::segment_path(&data_dir, *seg, self.config.segments_per_directory);
            // Pass one: find the live entries and the tombstones worth
            // carrying forward
            let mut live: Vec<(ChunkId, u64)> = Vec::new();
            let mut tombstones: Vec<ChunkId> = Vec::new();
            {
                let index = &self.index;
                let mut reader = SegmentReader::open(File::open(&seg_path)?)?;
                reader.scan_entries(|offset, entry| {
                    match entry.tag {
                        segment::EntryTag::Put => {
                            let id = entry.id.unwrap();
                            if index.lookup(id).map(|l| (l.segment, l.offset))
                                == Some((*seg, offset))
                            {
                                live.push((id, offset));
                            }
                        }
                        segment::EntryTag::Delete => {
                            let id = entry.id.unwrap();
                            // An older segment may still hold a shadowed put
                            // for this id; keep the tombstone so a replay
                            // from scratch stays correct
                            if !index.contains(id) {
                                tombstones.push(id);
                            }
                        }
                        segment::EntryTag::Commit => {}
                    }
                    Ok(())
                })?;
            }
            // Pass two: move the live entries
            for (id, offset) in live {
                let location = SegmentDescriptor {
                    segment: *seg,
                    offset,
                    len: 0,
                };
                let entry = self.entry_at(location)?;
                let payload = entry.payload.expect("live entry is a put");
                let put = SegmentEntry::put(id, payload);
                let len = put.framed_len();
                let new_seg = self.writer_for(u64::from(len))?;
                let new_offset = self.writer.as_mut().unwrap().append(&put)?;
                self.index.set(
                    id,
                    SegmentDescriptor {
                        segment: new_seg,
                        offset: new_offset,
                        len,
                    },
                );
                self.hints.record_put(new_seg, u64::from(len));
            }
            for id in tombstones {
                let entry = SegmentEntry::delete(id);
                let new_seg = self.writer_for(u64::from(entry.framed_len()))?;
                self.writer.as_mut().unwrap().append(&entry)?;
                self.hints
                    .record_put(new_seg, u64::from(entry.framed_len()));
            }
            report.segments_compacted += 1;
        }

        for seg in &candidates {
            self.hints.forget_segment(*seg);
        }
        self.commit()?;
        // A compaction that moved nothing has no open segment; the pruned
        // hints still need to land on disk
        self.index.save(&self.path, self.txn_segment)?;
        self.hints.save(&self.path, self.txn_segment)?;
        // Only after the replacement data is durable do the originals go
        for seg in &candidates {
            let seg_path =
                segment::segment_path(&data_dir, *seg, self.config.segments_per_directory);
            if let Ok(meta) = std::fs::metadata(&seg_path) {
                report.bytes_reclaimed += meta.len();
            }
            remove_file(&seg_path)?;
            self.readers.pop(seg);
        }
        info!(
            "Compacted {} segments, reclaimed {} bytes",
            report.segments_compacted, report.bytes_reclaimed
        );
        Ok(report)
    }

    /// Gets a reference to the repository's key
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mode(&self) -> KeyMode {
        self.key_mode
    }

    pub fn settings(&self) -> ChunkSettings {
        self.config.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Id of the last committed transaction (the snapshot generation)
    pub fn transaction_id(&self) -> u64 {
        self.txn_segment
    }
}

/// Reads the repository-side nonce high-water mark, used to detect a
/// client whose nonce counter went backwards
fn read_repo_nonce(repository: &Path) -> Option<u64> {
    let mut buffer = Vec::new();
    File::open(repository.join("nonce"))
        .ok()?
        .read_to_end(&mut buffer)
        .ok()?;
    if buffer.len() == 8 {
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&buffer);
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    }
}

fn write_repo_nonce(repository: &Path, value: u64) -> Result<()> {
    let tmp = repository.join("nonce.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&value.to_le_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(tmp, repository.join("nonce"))?;
    Ok(())
}
