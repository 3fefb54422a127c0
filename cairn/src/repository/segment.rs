/*!
Segment files: the append-only log the repository is made of.

A segment starts with a magic header identifying the on-disk format
version, followed by a sequence of framed entries:

```text
[ crc32 | size | tag | id? | payload? ]
```

`crc32` (little endian) covers everything after itself, `size` is the total
entry length including the crc and size fields, and `tag` is PUT, DELETE,
or COMMIT. PUT carries a 32-byte object id and a payload (the serialised
object envelope); DELETE carries just the id; COMMIT carries neither and
seals the segment, marking a transaction boundary. No entry ever straddles
two segment files.
*/
use crate::repository::files::LockedFile;
use cairn_core::repository::ChunkId;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs::create_dir_all;
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number used for cairn segment files
const MAGIC_NUMBER: [u8; 8] = *b"CAIRNSEG";

/// Size in bytes of the bincoded segment header
pub const HEADER_SIZE: u64 = 14;

/// Fixed bytes of every entry: crc (4) + size (4) + tag (1)
const ENTRY_OVERHEAD: u32 = 9;

/// Upper bound on a single entry, to keep corrupt size fields from driving
/// giant allocations
pub const MAX_ENTRY_SIZE: u32 = 128 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("I/O error on segment file")]
    IOError(#[from] std::io::Error),
    #[error("Segment failed header validation; unknown magic or format version")]
    BadMagic,
    #[error("Corrupt entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },
    #[error("Segment file is already locked by another writer")]
    Locked,
}

type Result<T> = std::result::Result<T, SegmentError>;

/// Representation of the header at the start of each segment file.
///
/// Bincoded directly, big endian, into a fixed 14-byte prefix.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Header {
    magic_number: [u8; 8],
    major: u16,
    minor: u16,
    patch: u16,
}

impl Header {
    /// Checks if a header is valid for this version of cairn.
    ///
    /// Currently only checks the magic number; reading a segment with an
    /// unknown magic is a fatal error, format changes require an explicit
    /// upgrade step.
    pub fn validate(&self) -> bool {
        self.magic_number == MAGIC_NUMBER
    }

    /// Reconstructs the version string of the writer that created this
    /// segment
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for Header {
    /// Constructs a header using the correct values for this version of
    /// cairn
    fn default() -> Header {
        Header {
            magic_number: MAGIC_NUMBER,
            major: crate::VERSION_PIECES[0],
            minor: crate::VERSION_PIECES[1],
            patch: crate::VERSION_PIECES[2],
        }
    }
}

/// Writes the header to the start of an empty segment file
fn write_header(handle: &mut impl Write) -> Result<()> {
    let mut config = bincode::config();
    config
        .big_endian()
        .serialize_into(&mut *handle, &Header::default())
        .map_err(|err| SegmentError::CorruptEntry {
            offset: 0,
            reason: format!("header serialization failed: {}", err),
        })?;
    Ok(())
}

/// Reads and validates the header of a segment file
fn read_header(handle: &mut impl Read) -> Result<Header> {
    let mut config = bincode::config();
    let header: Header = config
        .big_endian()
        .deserialize_from(&mut *handle)
        .map_err(|_| SegmentError::BadMagic)?;
    if header.validate() {
        Ok(header)
    } else {
        Err(SegmentError::BadMagic)
    }
}

/// The operation an entry records
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryTag {
    Put,
    Delete,
    Commit,
}

impl EntryTag {
    fn as_byte(self) -> u8 {
        match self {
            EntryTag::Put => 0,
            EntryTag::Delete => 1,
            EntryTag::Commit => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<EntryTag> {
        match byte {
            0 => Some(EntryTag::Put),
            1 => Some(EntryTag::Delete),
            2 => Some(EntryTag::Commit),
            _ => None,
        }
    }
}

/// One framed entry, as replayed from a segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentEntry {
    pub tag: EntryTag,
    pub id: Option<ChunkId>,
    pub payload: Option<Vec<u8>>,
}

impl SegmentEntry {
    pub fn put(id: ChunkId, payload: Vec<u8>) -> SegmentEntry {
        SegmentEntry {
            tag: EntryTag::Put,
            id: Some(id),
            payload: Some(payload),
        }
    }

    pub fn delete(id: ChunkId) -> SegmentEntry {
        SegmentEntry {
            tag: EntryTag::Delete,
            id: Some(id),
            payload: None,
        }
    }

    pub fn commit() -> SegmentEntry {
        SegmentEntry {
            tag: EntryTag::Commit,
            id: None,
            payload: None,
        }
    }

    /// Total framed size of this entry in bytes
    pub fn framed_len(&self) -> u32 {
        let id_len = if self.id.is_some() { 32 } else { 0 };
        let payload_len = self.payload.as_ref().map_or(0, Vec::len) as u32;
        ENTRY_OVERHEAD + id_len + payload_len
    }
}

/// Appends a framed entry, returning the number of bytes written
pub fn write_entry(handle: &mut impl Write, entry: &SegmentEntry) -> Result<u32> {
    let size = entry.framed_len();
    // Body is everything the crc covers: the size field onward
    let mut body = Vec::with_capacity(size as usize - 4);
    body.write_u32::<LE>(size)?;
    body.push(entry.tag.as_byte());
    if let Some(id) = entry.id {
        body.extend_from_slice(id.as_bytes());
    }
    if let Some(payload) = &entry.payload {
        body.extend_from_slice(payload);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    handle.write_u32::<LE>(hasher.finalize())?;
    handle.write_all(&body)?;
    Ok(size)
}

/// Reads one framed entry.
///
/// Returns `Ok(None)` on a clean end of file (zero bytes remaining);
/// truncation mid-entry and CRC mismatches surface as `CorruptEntry`.
pub fn read_entry(handle: &mut impl Read, offset: u64) -> Result<Option<SegmentEntry>> {
    let corrupt = |reason: &str| SegmentError::CorruptEntry {
        offset,
        reason: reason.to_string(),
    };
    let crc = match handle.read_u32::<LE>() {
        Ok(crc) => crc,
        Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut size_bytes = [0_u8; 4];
    handle
        .read_exact(&mut size_bytes)
        .map_err(|_| corrupt("truncated size field"))?;
    let size = u32::from_le_bytes(size_bytes);
    if size < ENTRY_OVERHEAD || size > MAX_ENTRY_SIZE {
        return Err(corrupt(&format!("implausible entry size {}", size)));
    }
    let mut body = vec![0_u8; size as usize - 8];
    handle
        .read_exact(&mut body)
        .map_err(|_| corrupt("truncated entry body"))?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&size_bytes);
    hasher.update(&body);
    if hasher.finalize() != crc {
        return Err(corrupt("crc mismatch"));
    }
    let tag = EntryTag::from_byte(body[0]).ok_or_else(|| corrupt("unknown entry tag"))?;
    let rest = &body[1..];
    match tag {
        EntryTag::Commit => {
            if !rest.is_empty() {
                return Err(corrupt("commit entry carries unexpected bytes"));
            }
            Ok(Some(SegmentEntry::commit()))
        }
        EntryTag::Delete => {
            if rest.len() != 32 {
                return Err(corrupt("delete entry has malformed id"));
            }
            Ok(Some(SegmentEntry::delete(ChunkId::new(rest))))
        }
        EntryTag::Put => {
            if rest.len() < 32 {
                return Err(corrupt("put entry too short for an id"));
            }
            let (id, payload) = rest.split_at(32);
            Ok(Some(SegmentEntry::put(
                ChunkId::new(id),
                payload.to_vec(),
            )))
        }
    }
}

/// Reads and CRC-validates the single entry at `offset`
pub fn read_entry_at<T: Read + Seek>(handle: &mut T, offset: u64) -> Result<SegmentEntry> {
    handle.seek(SeekFrom::Start(offset))?;
    read_entry(handle, offset)?.ok_or(SegmentError::CorruptEntry {
        offset,
        reason: "entry offset points past end of segment".to_string(),
    })
}

/// Outcome of a sequential scan over a segment's entries
#[derive(Debug)]
pub struct ScanOutcome {
    /// Offset one past the final valid entry
    pub end_offset: u64,
    /// Offset one past the last COMMIT entry, if any
    pub last_commit_end: Option<u64>,
    /// Set when the scan stopped at a corrupt or truncated entry rather
    /// than a clean end of file
    pub corruption: Option<(u64, String)>,
}

/// A read-only view of one segment file
#[derive(Debug)]
pub struct SegmentReader<T> {
    handle: T,
}

impl<T: Read + Seek> SegmentReader<T> {
    /// Opens a segment for reading, validating its header
    pub fn open(mut handle: T) -> Result<SegmentReader<T>> {
        handle.seek(SeekFrom::Start(0))?;
        read_header(&mut handle)?;
        Ok(SegmentReader { handle })
    }

    /// Reads the entry at the given offset
    pub fn entry_at(&mut self, offset: u64) -> Result<SegmentEntry> {
        read_entry_at(&mut self.handle, offset)
    }

    /// Walks every entry in order, invoking the callback with (offset,
    /// entry). The scan stops at the first corrupt entry; corruption is
    /// reported in the outcome, not as an error.
    pub fn scan_entries<F>(&mut self, mut callback: F) -> Result<ScanOutcome>
    where
        F: FnMut(u64, SegmentEntry) -> Result<()>,
    {
        self.handle.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut offset = HEADER_SIZE;
        let mut last_commit_end = None;
        loop {
            match read_entry(&mut self.handle, offset) {
                Ok(None) => {
                    return Ok(ScanOutcome {
                        end_offset: offset,
                        last_commit_end,
                        corruption: None,
                    });
                }
                Ok(Some(entry)) => {
                    let next = offset + u64::from(entry.framed_len());
                    if entry.tag == EntryTag::Commit {
                        last_commit_end = Some(next);
                    }
                    callback(offset, entry)?;
                    offset = next;
                }
                Err(SegmentError::CorruptEntry { offset: at, reason }) => {
                    return Ok(ScanOutcome {
                        end_offset: offset,
                        last_commit_end,
                        corruption: Some((at, reason)),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The currently-open segment a transaction appends to
#[derive(Debug)]
pub struct SegmentWriter {
    handle: BufWriter<LockedFile>,
    offset: u64,
}

impl SegmentWriter {
    /// Creates (or re-opens for append) the segment file at `path`,
    /// writing the format header if the file is empty.
    ///
    /// # Errors
    ///
    /// Fails with `Locked` if another writer holds the segment, and with
    /// `BadMagic` if an existing file fails header validation.
    pub fn create(path: &Path) -> Result<SegmentWriter> {
        let mut file = LockedFile::open_read_write(path)?.ok_or(SegmentError::Locked)?;
        let end = file.seek(SeekFrom::End(0))?;
        if end == 0 {
            write_header(&mut file)?;
            file.flush()?;
            Ok(SegmentWriter {
                handle: BufWriter::with_capacity(1_000_000, file),
                offset: HEADER_SIZE,
            })
        } else {
            file.seek(SeekFrom::Start(0))?;
            read_header(&mut file)?;
            file.seek(SeekFrom::End(0))?;
            Ok(SegmentWriter {
                handle: BufWriter::with_capacity(1_000_000, file),
                offset: end,
            })
        }
    }

    /// Appends an entry, returning its starting offset
    pub fn append(&mut self, entry: &SegmentEntry) -> Result<u64> {
        let offset = self.offset;
        let written = write_entry(&mut self.handle, entry)?;
        self.offset += u64::from(written);
        Ok(offset)
    }

    /// Current size of the segment in bytes
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Appends a COMMIT entry and makes the whole segment durable
    pub fn commit(&mut self) -> Result<()> {
        self.append(&SegmentEntry::commit())?;
        self.handle.flush()?;
        self.handle.get_ref().sync_all()?;
        Ok(())
    }

    /// Flushes buffered entries without committing
    pub fn flush(&mut self) -> Result<()> {
        self.handle.flush()?;
        Ok(())
    }
}

/// Scans a segment file and reports the offset one past its last COMMIT
/// entry, for truncating uncommitted tails
pub fn last_commit_end(path: &Path) -> Result<Option<u64>> {
    let mut reader = SegmentReader::open(std::fs::File::open(path)?)?;
    let outcome = reader.scan_entries(|_, _| Ok(()))?;
    Ok(outcome.last_commit_end)
}

/// Resolves the path of a segment file, bucketing `segments_per_directory`
/// files per data subdirectory
pub fn segment_path(data_dir: &Path, segment_id: u64, segments_per_directory: u64) -> PathBuf {
    let bucket = segment_id / segments_per_directory;
    data_dir.join(bucket.to_string()).join(segment_id.to_string())
}

/// Like `segment_path`, but creates the bucket directory if needed
pub fn segment_path_create(
    data_dir: &Path,
    segment_id: u64,
    segments_per_directory: u64,
) -> Result<PathBuf> {
    let path = segment_path(data_dir, segment_id, segments_per_directory);
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    Ok(path)
}

/// Truncates a segment file to `len` bytes, discarding uncommitted entries
pub fn truncate_segment(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Scans the data directory for the highest numbered segment file
pub fn highest_segment(data_dir: &Path) -> u64 {
    walkdir::WalkDir::new(data_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter_map(|e| e.parse::<u64>().ok())
        .max()
        .unwrap_or(0)
}

/// Lists all live segment ids in ascending order
pub fn all_segments(data_dir: &Path) -> Vec<u64> {
    let mut segments: Vec<u64> = walkdir::WalkDir::new(data_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter_map(|e| e.parse::<u64>().ok())
        .collect();
    segments.sort_unstable();
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn entry_round_trip(entry: SegmentEntry) {
        let mut buffer = Vec::new();
        let written = write_entry(&mut buffer, &entry).unwrap();
        assert_eq!(written as usize, buffer.len());
        assert_eq!(written, entry.framed_len());
        let back = read_entry(&mut Cursor::new(&buffer), 0).unwrap().unwrap();
        assert_eq!(entry, back);
    }

    #[test]
    fn framing_round_trips() {
        entry_round_trip(SegmentEntry::put(ChunkId::random_id(), vec![1, 2, 3, 4]));
        entry_round_trip(SegmentEntry::put(ChunkId::random_id(), Vec::new()));
        entry_round_trip(SegmentEntry::delete(ChunkId::random_id()));
        entry_round_trip(SegmentEntry::commit());
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let entry = SegmentEntry::put(ChunkId::random_id(), vec![0_u8; 64]);
        let mut buffer = Vec::new();
        write_entry(&mut buffer, &entry).unwrap();
        let target = buffer.len() - 10;
        buffer[target] ^= 0xff;
        let result = read_entry(&mut Cursor::new(&buffer), 0);
        assert!(matches!(
            result,
            Err(SegmentError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn truncated_entry_is_corrupt_not_eof() {
        let entry = SegmentEntry::put(ChunkId::random_id(), vec![0_u8; 64]);
        let mut buffer = Vec::new();
        write_entry(&mut buffer, &entry).unwrap();
        buffer.truncate(buffer.len() - 5);
        let result = read_entry(&mut Cursor::new(&buffer), 0);
        assert!(matches!(result, Err(SegmentError::CorruptEntry { .. })));
    }

    #[test]
    fn writer_reader_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let id = ChunkId::random_id();

        let mut writer = SegmentWriter::create(&path).unwrap();
        let offset = writer.append(&SegmentEntry::put(id, vec![9_u8; 100])).unwrap();
        writer.commit().unwrap();
        drop(writer);

        let mut reader = SegmentReader::open(File::open(&path).unwrap()).unwrap();
        let entry = reader.entry_at(offset).unwrap();
        assert_eq!(entry.id, Some(id));
        assert_eq!(entry.payload, Some(vec![9_u8; 100]));

        let mut seen = Vec::new();
        let outcome = reader
            .scan_entries(|off, entry| {
                seen.push((off, entry.tag));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(outcome.corruption.is_none());
        assert_eq!(outcome.last_commit_end, Some(outcome.end_offset));
    }

    #[test]
    fn scan_stops_at_garbage_after_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        {
            let mut writer = SegmentWriter::create(&path).unwrap();
            writer
                .append(&SegmentEntry::put(ChunkId::random_id(), vec![1_u8; 10]))
                .unwrap();
            writer.commit().unwrap();
        }
        // Simulate a torn write after the commit
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
        }
        let mut reader = SegmentReader::open(File::open(&path).unwrap()).unwrap();
        let outcome = reader.scan_entries(|_, _| Ok(())).unwrap();
        assert!(outcome.corruption.is_some());
        let commit_end = outcome.last_commit_end.unwrap();
        assert_eq!(outcome.end_offset, commit_end);
    }

    #[test]
    fn unknown_magic_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        std::fs::write(&path, b"NOTCAIRNSEGMENTFILE").unwrap();
        let result = SegmentReader::open(File::open(&path).unwrap());
        assert!(matches!(result, Err(SegmentError::BadMagic)));
    }

    #[test]
    fn fanout_paths() {
        let data = Path::new("data");
        assert_eq!(segment_path(data, 0, 1000), data.join("0").join("0"));
        assert_eq!(segment_path(data, 999, 1000), data.join("0").join("999"));
        assert_eq!(segment_path(data, 1000, 1000), data.join("1").join("1000"));
    }
}
