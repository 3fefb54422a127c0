/*!
Archive assembly: turning a filesystem walk into a snapshot, and a
snapshot back into a filesystem.

An archive is three layers of objects. Item records (one per filesystem
object) are serialised into a byte stream; that stream is chunked with the
same content-defined chunker as file data and stored as ordinary objects;
the archive metadata object lists those item-stream chunk ids; and the
manifest maps the archive's name to the metadata object. File content
itself is chunked, deduplicated against the chunks index, and stored once
per distinct chunk across all archives.
*/
use crate::cache::{ChunkIndex, FilesIndex};
use crate::manifest::{Manifest, ManifestError};
use crate::repository::{Repository, RepositoryError};
use crate::walker::WalkEntry;
use cairn_core::archive::record::CHECKPOINT_SUFFIX;
use cairn_core::archive::{ArchiveRecord, ArchiveStats, ChunkRef, ChunkerParams, Item, ItemType};
use cairn_core::repository::{ChunkId, ObjectKind};
use cairn_chunker::{BuzHash, Chunker, ChunkerError};

use chrono::prelude::*;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument, trace, warn};

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::time::{Duration, Instant};

pub mod check;
pub mod extract;
pub mod names;
pub mod prune;
pub mod recreate;

pub use check::{check_archives, ArchiveCheckReport};
pub use extract::{extract, ExtractReport};
pub use names::{substitute_placeholders, validate_name};
pub use prune::{prune, PrunePolicy, PruneReport};
pub use recreate::recreate;

/// Serialised item records accumulate up to this many bytes before the
/// buffer is chunked and flushed to the repository
const ITEM_STREAM_BUFFER: usize = 16 * 1024 * 1024;

/// Error for all the things that can go wrong with handling archives
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Repository error")]
    Repository(#[from] RepositoryError),
    #[error("Manifest error")]
    Manifest(#[from] ManifestError),
    #[error("Chunker error")]
    Chunker(#[from] ChunkerError),
    #[error("Cache error")]
    Cache(#[from] crate::cache::CacheError),
    #[error("I/O error")]
    IOError(#[from] std::io::Error),
    #[error("Record failed to serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Invalid archive name: {0}")]
    InvalidName(String),
    #[error("Archive {0} does not exist")]
    ArchiveMissing(String),
    #[error("Object {0} is not what its kind tag claims")]
    WrongObjectKind(ChunkId),
    #[error("Item stream is corrupt (undecodable trailing bytes)")]
    ItemStreamCorrupt,
}

type Result<T> = std::result::Result<T, ArchiveError>;

/// Loads and parses an archive metadata object
pub fn load_archive_record(repo: &mut Repository, id: ChunkId) -> Result<ArchiveRecord> {
    let (kind, bytes) = repo.get_data(id)?;
    if kind != ObjectKind::Archive {
        return Err(ArchiveError::WrongObjectKind(id));
    }
    rmp_serde::decode::from_read(&bytes[..]).map_err(|_| ArchiveError::ItemStreamCorrupt)
}

/// Looks an archive up by name and loads its metadata
pub fn load_archive_by_name(
    repo: &mut Repository,
    manifest: &Manifest,
    name: &str,
) -> Result<(ChunkId, ArchiveRecord)> {
    let pointer = manifest
        .get(name)
        .ok_or_else(|| ArchiveError::ArchiveMissing(name.to_string()))?;
    let record = load_archive_record(repo, pointer.id)?;
    Ok((pointer.id, record))
}

/// Streams item records out of an archive's meta chunks, one at a time,
/// without materialising the whole stream
pub struct ItemStreamReader {
    remaining: VecDeque<ChunkId>,
    buffer: Vec<u8>,
    pos: usize,
}

impl ItemStreamReader {
    pub fn new(meta_chunks: Vec<ChunkId>) -> ItemStreamReader {
        ItemStreamReader {
            remaining: meta_chunks.into(),
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Produces the next item, fetching further meta chunks as the decoder
    /// runs dry
    pub fn next_item(&mut self, repo: &mut Repository) -> Result<Option<Item>> {
        loop {
            if self.pos < self.buffer.len() {
                let mut cursor = Cursor::new(&self.buffer[self.pos..]);
                let mut de = rmp_serde::Deserializer::new(&mut cursor);
                match Item::deserialize(&mut de) {
                    Ok(item) => {
                        self.pos += cursor.position() as usize;
                        // Drop consumed bytes now and then so the buffer
                        // stays bounded
                        if self.pos > ITEM_STREAM_BUFFER {
                            self.buffer.drain(..self.pos);
                            self.pos = 0;
                        }
                        return Ok(Some(item));
                    }
                    Err(_) if !self.remaining.is_empty() => {
                        // Record straddles a chunk boundary; pull more data
                    }
                    Err(_) => return Err(ArchiveError::ItemStreamCorrupt),
                }
            } else if self.remaining.is_empty() {
                return Ok(None);
            }
            let next = self.remaining.pop_front().expect("checked non-empty");
            let (kind, bytes) = repo.get_data(next)?;
            if kind != ObjectKind::ItemStream {
                return Err(ArchiveError::WrongObjectKind(next));
            }
            self.buffer.extend_from_slice(&bytes);
        }
    }
}

/// Accumulates serialised items and flushes them as content-defined meta
/// chunks
pub(crate) struct ItemStreamWriter {
    buffer: Vec<u8>,
    chunker: BuzHash,
    /// Ids of the flushed meta chunks, in order
    meta_ids: Vec<ChunkId>,
    /// (ref, newly_written) for every flushed meta chunk, for cache and
    /// stats bookkeeping
    flushed: Vec<(ChunkRef, bool)>,
}

impl ItemStreamWriter {
    pub(crate) fn new(chunker: BuzHash) -> ItemStreamWriter {
        ItemStreamWriter {
            buffer: Vec::new(),
            chunker,
            meta_ids: Vec::new(),
            flushed: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, repo: &mut Repository, item: &Item) -> Result<()> {
        rmp_serde::encode::write(&mut self.buffer, item)?;
        if self.buffer.len() >= ITEM_STREAM_BUFFER {
            self.flush(repo, false)?;
        }
        Ok(())
    }

    /// Chunks and stores the buffered bytes. Unless `last`, the final
    /// (boundary-less) chunk stays buffered so it can merge with whatever
    /// comes next.
    fn flush(&mut self, repo: &mut Repository, last: bool) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::replace(&mut self.buffer, Vec::new());
        let mut chunks: Vec<Vec<u8>> = Vec::new();
        for chunk in self.chunker.chunk(Cursor::new(buffer)) {
            chunks.push(chunk?);
        }
        if !last && chunks.len() > 1 {
            self.buffer = chunks.pop().expect("checked non-empty");
        } else if !last && chunks.len() == 1 {
            // Not enough data for a real boundary yet
            self.buffer = chunks.pop().expect("checked non-empty");
            return Ok(());
        }
        for data in chunks {
            let (id, existing, csize) = repo.put_data(&data, ObjectKind::ItemStream)?;
            self.meta_ids.push(id);
            self.flushed.push((
                ChunkRef {
                    id,
                    size: data.len() as u32,
                    csize,
                },
                !existing,
            ));
        }
        Ok(())
    }

    pub(crate) fn finish(
        mut self,
        repo: &mut Repository,
    ) -> Result<(Vec<ChunkId>, Vec<(ChunkRef, bool)>)> {
        self.flush(repo, true)?;
        Ok((self.meta_ids, self.flushed))
    }
}

/// Stores one data chunk deduplicated against the chunks index, keeping
/// the index's refcounts in step with the repository.
///
/// Returns the reference plus whether the chunk is new to the repository.
pub(crate) fn store_counted(
    repo: &mut Repository,
    index: &mut ChunkIndex,
    data: &[u8],
) -> Result<(ChunkRef, bool)> {
    let id = repo.id_of(data);
    if let Some(entry) = index.get(id) {
        index.add_ref(id);
        return Ok((
            ChunkRef {
                id,
                size: data.len() as u32,
                csize: entry.csize,
            },
            false,
        ));
    }
    let (id, existing, mut csize) = repo.put_data(data, ObjectKind::Data)?;
    if existing {
        // Present in the repository but unknown to the cache (e.g. the
        // cache was rebuilt while a write was in flight)
        csize = 0;
    }
    index.insert(id, data.len() as u32, csize);
    Ok((
        ChunkRef {
            id,
            size: data.len() as u32,
            csize,
        },
        !existing,
    ))
}

/// Options for archive creation
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub comment: String,
    /// Wall-clock interval between checkpoint archives
    pub checkpoint_interval: Duration,
    /// Suffix selecting which files index to use
    pub files_cache_suffix: String,
    /// Whether inode numbers participate in files-cache matching
    pub consider_inode: bool,
    pub command_line: String,
}

impl Default for ArchiveOptions {
    fn default() -> ArchiveOptions {
        ArchiveOptions {
            comment: String::new(),
            checkpoint_interval: Duration::from_secs(30 * 60),
            files_cache_suffix: String::new(),
            consider_inode: true,
            command_line: String::new(),
        }
    }
}

/// Builds one archive out of walked filesystem entries.
///
/// Typical use: construct, feed every [`WalkEntry`] to `add_entry`, then
/// `finish`. Long runs flush checkpoint archives on the configured
/// interval so an interrupted backup leaves something restorable behind.
pub struct ArchiveWriter<'a> {
    repo: &'a mut Repository,
    manifest: &'a mut Manifest,
    chunk_index: &'a mut ChunkIndex,
    files_index: &'a mut FilesIndex,
    chunker: BuzHash,
    chunker_params: ChunkerParams,
    name: String,
    options: ArchiveOptions,
    start: DateTime<FixedOffset>,
    items: ItemStreamWriter,
    stats: ArchiveStats,
    /// (device, inode) of seen multi-link files → stored path
    hardlinks: HashMap<(u64, u64), String>,
    last_checkpoint: Instant,
    /// References held by the previous checkpoint, to release when it is
    /// superseded: (record id, meta chunk ids)
    checkpoint: Option<(ChunkId, Vec<ChunkId>)>,
}

impl<'a> ArchiveWriter<'a> {
    pub fn new(
        repo: &'a mut Repository,
        manifest: &'a mut Manifest,
        chunk_index: &'a mut ChunkIndex,
        files_index: &'a mut FilesIndex,
        name: &str,
        options: ArchiveOptions,
    ) -> Result<ArchiveWriter<'a>> {
        validate_name(name)?;
        if manifest.contains(name) {
            return Err(ArchiveError::Manifest(ManifestError::ArchiveExists(
                name.to_string(),
            )));
        }
        // A checkpoint left behind by an interrupted earlier run of this
        // archive is superseded now; drop it before it leaks references
        let stale_checkpoint = format!("{}{}", name, CHECKPOINT_SUFFIX);
        if manifest.contains(&stale_checkpoint) {
            warn!(
                "Removing stale checkpoint {} from an interrupted backup",
                stale_checkpoint
            );
            delete_archive(repo, manifest, chunk_index, &stale_checkpoint)?;
        }
        let params = manifest.config.chunker;
        let chunker = BuzHash::new(
            repo.key().chunker_nonce(),
            params.min_size as usize,
            params.max_size as usize,
            params.mask_bits,
            params.window_size,
        );
        Ok(ArchiveWriter {
            repo,
            manifest,
            chunk_index,
            files_index,
            chunker,
            chunker_params: params,
            name: name.to_string(),
            options,
            start: Local::now().with_timezone(Local::now().offset()),
            items: ItemStreamWriter::new(chunker),
            stats: ArchiveStats::default(),
            hardlinks: HashMap::new(),
            last_checkpoint: Instant::now(),
            checkpoint: None,
        })
    }

    /// Stores one data chunk, deduplicating against the chunks index, and
    /// accounts for it in the archive's stats
    fn store_data_chunk(&mut self, data: &[u8]) -> Result<ChunkRef> {
        self.stats.original_size += data.len() as u64;
        let (chunk, new) = store_counted(self.repo, self.chunk_index, data)?;
        self.stats.compressed_size += u64::from(chunk.csize);
        if new {
            self.stats.deduplicated_size += u64::from(chunk.csize);
        }
        Ok(chunk)
    }

    /// Chunks and stores a regular file's content, consulting the files
    /// cache first
    fn process_file(&mut self, entry: &WalkEntry, item: &mut Item) -> Result<()> {
        let meta = metadata::unix_fields(&entry.metadata);
        let cached = self
            .files_index
            .lookup(
                &entry.stored_path,
                meta.inode,
                entry.metadata.len(),
                meta.mtime_ns,
                meta.ctime_ns,
                self.options.consider_inode,
            )
            .map(|hit| hit.chunks.clone());
        if let Some(chunks) = cached {
            // Trust the hit only while every referenced chunk still exists
            if chunks.iter().all(|c| self.chunk_index.contains(c.id)) {
                for chunk in &chunks {
                    self.chunk_index.add_ref(chunk.id);
                    self.stats.original_size += u64::from(chunk.size);
                    self.stats.compressed_size += u64::from(chunk.csize);
                }
                item.chunks = chunks;
                trace!("Files cache short-circuited {}", entry.stored_path);
                return Ok(());
            }
        }

        let file = BufReader::new(File::open(&entry.path)?);
        let mut refs = Vec::new();
        for chunk in self.chunker.chunk(file) {
            let data = chunk?;
            refs.push(self.store_data_chunk(&data)?);
        }
        self.files_index.memorize(
            entry.stored_path.clone(),
            meta.inode,
            entry.metadata.len(),
            meta.mtime_ns,
            meta.ctime_ns,
            refs.clone(),
        );
        item.chunks = refs;
        Ok(())
    }

    /// Adds one walked filesystem entry to the archive
    #[instrument(skip(self, entry), fields(path = %entry.stored_path))]
    pub fn add_entry(&mut self, entry: &WalkEntry) -> Result<()> {
        let mut item = metadata::item_for(entry)?;
        if item.item_type == ItemType::RegularFile {
            let meta = metadata::unix_fields(&entry.metadata);
            if meta.nlink > 1 {
                let link_key = (meta.dev, meta.inode);
                if let Some(source) = self.hardlinks.get(&link_key) {
                    item.item_type = ItemType::Hardlink {
                        source: source.clone(),
                    };
                    item.size = 0;
                } else {
                    self.hardlinks.insert(link_key, entry.stored_path.clone());
                }
            }
        }
        if item.item_type == ItemType::RegularFile {
            self.process_file(entry, &mut item)?;
            self.stats.nfiles += 1;
        }
        self.items.push(self.repo, &item)?;

        if self.last_checkpoint.elapsed() >= self.options.checkpoint_interval {
            self.write_checkpoint()?;
        }
        Ok(())
    }

    /// Adds a pre-built item (used by recreate and tests)
    pub fn add_item(&mut self, item: &Item) -> Result<()> {
        if item.item_type == ItemType::RegularFile {
            self.stats.nfiles += 1;
            for chunk in &item.chunks {
                self.stats.original_size += u64::from(chunk.size);
                self.stats.compressed_size += u64::from(chunk.csize);
            }
        }
        self.items.push(self.repo, item)?;
        Ok(())
    }

    fn build_record(&self, name: String, meta_ids: Vec<ChunkId>) -> ArchiveRecord {
        let end = Local::now().with_timezone(Local::now().offset());
        ArchiveRecord {
            version: 1,
            name,
            comment: self.options.comment.clone(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            command_line: self.options.command_line.clone(),
            start: self.start,
            end,
            item_stream: meta_ids,
            chunker: self.chunker_params,
            stats: self.stats,
        }
    }

    fn store_record(&mut self, record: &ArchiveRecord) -> Result<ChunkId> {
        let bytes = rmp_serde::to_vec(record)?;
        let (id, existing, csize) = self.repo.put_data(&bytes, ObjectKind::Archive)?;
        if self.chunk_index.contains(id) {
            self.chunk_index.add_ref(id);
        } else {
            self.chunk_index
                .insert(id, bytes.len() as u32, if existing { 0 } else { csize });
        }
        Ok(id)
    }

    /// Account for the flushed meta chunks in the chunks index and stats
    fn absorb_flushed(&mut self) {
        let flushed = std::mem::replace(&mut self.items.flushed, Vec::new());
        for (chunk, new) in flushed {
            if self.chunk_index.contains(chunk.id) {
                self.chunk_index.add_ref(chunk.id);
            } else {
                self.chunk_index.insert(chunk.id, chunk.size, chunk.csize);
            }
            if new {
                self.stats.deduplicated_size += u64::from(chunk.csize);
            }
        }
    }

    /// Flushes a checkpoint archive: a durable partial snapshot named
    /// `<name>.checkpoint`, replaced by each subsequent checkpoint and
    /// removed when the archive completes
    fn write_checkpoint(&mut self) -> Result<()> {
        // Full flush: the checkpoint must cover every item seen so far
        self.items.flush(self.repo, true)?;
        self.absorb_flushed();
        let checkpoint_name = format!("{}{}", self.name, CHECKPOINT_SUFFIX);
        let meta_ids = self.items.meta_ids.clone();
        // Every meta chunk written so far gains a reference from the
        // checkpoint, released when the checkpoint is superseded
        for id in &meta_ids {
            if self.chunk_index.contains(*id) {
                self.chunk_index.add_ref(*id);
            }
        }
        let record = self.build_record(checkpoint_name.clone(), meta_ids.clone());
        let record_id = self.store_record(&record)?;

        self.release_checkpoint()?;
        if self.manifest.contains(&checkpoint_name) {
            self.manifest.remove_archive(&checkpoint_name)?;
        }
        self.manifest
            .add_archive(&checkpoint_name, record_id, self.start)?;
        self.manifest.store(self.repo)?;
        self.repo.commit()?;
        self.checkpoint = Some((record_id, meta_ids));
        self.last_checkpoint = Instant::now();
        info!("Flushed checkpoint archive {}", checkpoint_name);
        Ok(())
    }

    /// Releases the references held by the previous checkpoint
    fn release_checkpoint(&mut self) -> Result<()> {
        if let Some((record_id, meta_ids)) = self.checkpoint.take() {
            for id in meta_ids {
                if self.chunk_index.del_ref(id) {
                    delete_if_present(self.repo, id)?;
                }
            }
            if self.chunk_index.del_ref(record_id) {
                delete_if_present(self.repo, record_id)?;
            }
        }
        Ok(())
    }

    /// Completes the archive: final item-stream flush, metadata object,
    /// manifest update, commit
    #[instrument(skip(self))]
    pub fn finish(mut self) -> Result<ArchiveRecord> {
        let items = std::mem::replace(&mut self.items, ItemStreamWriter::new(self.chunker));
        let (meta_ids, flushed) = items.finish(self.repo)?;
        self.items.flushed = flushed;
        self.absorb_flushed();

        let record = self.build_record(self.name.clone(), meta_ids);
        let record_id = self.store_record(&record)?;

        // The completed archive supersedes any checkpoint
        self.release_checkpoint()?;
        let checkpoint_name = format!("{}{}", self.name, CHECKPOINT_SUFFIX);
        if self.manifest.contains(&checkpoint_name) {
            self.manifest.remove_archive(&checkpoint_name)?;
        }

        self.manifest.add_archive(&self.name, record_id, self.start)?;
        self.manifest.store(self.repo)?;
        self.repo.commit()?;
        self.chunk_index
            .set_manifest_stamp(self.manifest.stamp());
        self.files_index.age_and_evict();
        info!(
            "Created archive {} ({} files, {} bytes original, {} bytes new)",
            record.name, record.stats.nfiles, record.stats.original_size,
            record.stats.deduplicated_size
        );
        Ok(record)
    }
}

/// Issues a repository delete, tolerating objects that are already gone
/// (e.g. dropped earlier by storage repair)
pub(crate) fn delete_if_present(repo: &mut Repository, id: ChunkId) -> Result<()> {
    match repo.delete(id) {
        Ok(()) => Ok(()),
        Err(RepositoryError::ObjectMissing(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Deletes an archive: decrements every chunk it references, removes
/// objects whose refcount reaches zero, and drops the manifest entry.
///
/// The chunks index must be in sync with the manifest before calling.
#[instrument(skip(repo, manifest, chunk_index))]
pub fn delete_archive(
    repo: &mut Repository,
    manifest: &mut Manifest,
    chunk_index: &mut ChunkIndex,
    name: &str,
) -> Result<()> {
    let (record_id, record) = load_archive_by_name(repo, manifest, name)?;

    // Data chunks first, streaming the items out before their meta chunks
    // are released
    let mut data_refs: Vec<ChunkRef> = Vec::new();
    {
        let mut items = ItemStreamReader::new(record.item_stream.clone());
        while let Some(item) = items.next_item(repo)? {
            data_refs.extend(item.chunks.iter().copied());
        }
    }
    for chunk in data_refs {
        if chunk_index.del_ref(chunk.id) {
            delete_if_present(repo, chunk.id)?;
        }
    }
    for meta_id in &record.item_stream {
        if chunk_index.del_ref(*meta_id) {
            delete_if_present(repo, *meta_id)?;
        }
    }
    if chunk_index.del_ref(record_id) {
        delete_if_present(repo, record_id)?;
    }

    manifest.remove_archive(name)?;
    manifest.store(repo)?;
    repo.commit()?;
    chunk_index.set_manifest_stamp(manifest.stamp());
    info!("Deleted archive {}", name);
    Ok(())
}

/// Unix metadata capture and item construction
pub(crate) mod metadata {
    use super::*;

    pub struct UnixFields {
        pub dev: u64,
        pub inode: u64,
        pub nlink: u64,
        pub mode: u32,
        pub uid: u32,
        pub gid: u32,
        pub mtime_ns: i64,
        pub atime_ns: i64,
        pub ctime_ns: i64,
    }

    #[cfg(unix)]
    pub fn unix_fields(metadata: &std::fs::Metadata) -> UnixFields {
        use std::os::unix::fs::MetadataExt;
        UnixFields {
            dev: metadata.dev(),
            inode: metadata.ino(),
            nlink: metadata.nlink(),
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime_ns: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            atime_ns: metadata.atime() * 1_000_000_000 + metadata.atime_nsec(),
            ctime_ns: metadata.ctime() * 1_000_000_000 + metadata.ctime_nsec(),
        }
    }

    #[cfg(not(unix))]
    pub fn unix_fields(metadata: &std::fs::Metadata) -> UnixFields {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as i64);
        UnixFields {
            dev: 0,
            inode: 0,
            nlink: 1,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime_ns: mtime,
            atime_ns: mtime,
            ctime_ns: mtime,
        }
    }

    #[cfg(unix)]
    pub fn username_for(uid: u32) -> Option<String> {
        // getpwuid is not reentrant, but the engine is single threaded
        unsafe {
            let record = libc::getpwuid(uid);
            if record.is_null() {
                return None;
            }
            Some(
                std::ffi::CStr::from_ptr((*record).pw_name)
                    .to_string_lossy()
                    .into_owned(),
            )
        }
    }

    #[cfg(unix)]
    pub fn groupname_for(gid: u32) -> Option<String> {
        unsafe {
            let record = libc::getgrgid(gid);
            if record.is_null() {
                return None;
            }
            Some(
                std::ffi::CStr::from_ptr((*record).gr_name)
                    .to_string_lossy()
                    .into_owned(),
            )
        }
    }

    #[cfg(not(unix))]
    pub fn username_for(_uid: u32) -> Option<String> {
        None
    }

    #[cfg(not(unix))]
    pub fn groupname_for(_gid: u32) -> Option<String> {
        None
    }

    /// Builds an item (without file content) from a walked entry
    pub fn item_for(entry: &WalkEntry) -> Result<Item> {
        let fields = unix_fields(&entry.metadata);
        let file_type = entry.metadata.file_type();
        let item_type = if file_type.is_dir() {
            ItemType::Directory
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&entry.path)?
                .to_string_lossy()
                .into_owned();
            ItemType::Symlink { target }
        } else if file_type.is_file() {
            ItemType::RegularFile
        } else {
            special_item_type(entry)
        };
        Ok(Item {
            path: entry.stored_path.clone(),
            item_type,
            mode: fields.mode,
            uid: fields.uid,
            gid: fields.gid,
            user: username_for(fields.uid),
            group: groupname_for(fields.gid),
            mtime_ns: fields.mtime_ns,
            atime_ns: fields.atime_ns,
            ctime_ns: fields.ctime_ns,
            birthtime_ns: entry
                .metadata
                .created()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64),
            size: if file_type.is_file() {
                entry.metadata.len()
            } else {
                0
            },
            chunks: Vec::new(),
            chunks_healthy: None,
        })
    }

    #[cfg(unix)]
    fn special_item_type(entry: &WalkEntry) -> ItemType {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;
        let file_type = entry.metadata.file_type();
        let rdev = entry.metadata.rdev();
        let major = ((rdev >> 8) & 0xfff) as u32;
        let minor = ((rdev & 0xff) | ((rdev >> 12) & 0xfff00)) as u32;
        if file_type.is_char_device() {
            ItemType::CharDevice { major, minor }
        } else if file_type.is_block_device() {
            ItemType::BlockDevice { major, minor }
        } else {
            ItemType::Fifo
        }
    }

    #[cfg(not(unix))]
    fn special_item_type(_entry: &WalkEntry) -> ItemType {
        ItemType::Fifo
    }
}
