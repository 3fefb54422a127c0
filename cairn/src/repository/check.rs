/*!
Repository checking and repair, at the storage layer.

`check` walks every segment, validating the format header and every
entry's CRC and size; with `verify_data` each object is additionally
decrypted and its plain text re-hashed against its id. With `repair`,
readable entries are salvaged out of damaged segments into fresh ones, the
index is rebuilt from what actually survives, and the damaged files are
removed.

A bounded check (`max_duration`) persists the last fully checked segment
number in the repository and resumes there next time. Compaction may
delete the segment the cursor names; resumption simply continues from the
next live segment, so the cursor survives concurrent compactions.

Consistency of the object graph (manifest → archives → items) is the
archive layer's check, layered on top of this one.
*/
use super::{
    segment, Repository, RepositoryError, RepositoryIndex, SegmentDescriptor, SegmentEntry,
};
use cairn_core::repository::{Chunk, ChunkId, Key};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use std::fs::{remove_file, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

const CHECK_CURSOR_FILE: &str = "checkpoint.check";

type Result<T> = std::result::Result<T, RepositoryError>;

/// What a check run should do
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckOptions {
    /// Decrypt every object and re-verify its id, not just the framing
    pub verify_data: bool,
    /// Salvage damaged segments and rebuild the index
    pub repair: bool,
    /// Stop after roughly this long, persisting a resume cursor
    pub max_duration: Option<Duration>,
}

/// Findings of a check run
#[derive(Debug, Default)]
pub struct CheckReport {
    pub segments_checked: usize,
    pub objects_verified: usize,
    /// Human-readable descriptions of every problem found
    pub errors: Vec<String>,
    /// False when a bounded check stopped early
    pub complete: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct CheckCursor {
    repository: Uuid,
    /// Highest segment number fully checked
    segment: u64,
}

/// Validates a PUT entry's envelope: parse, MAC, decrypt, re-hash
fn verify_put_entry(key: &Key, entry: &SegmentEntry) -> std::result::Result<(), String> {
    let id = entry.id.expect("put entry always carries an id");
    let payload = entry
        .payload
        .as_ref()
        .expect("put entry always carries a payload");
    let chunk: Chunk = rmp_serde::decode::from_read(&payload[..])
        .map_err(|err| format!("object {}: envelope failed to parse: {}", id, err))?;
    if chunk.get_id() != id {
        return Err(format!("object {}: envelope id does not match entry", id));
    }
    chunk
        .unpack(key)
        .map_err(|err| format!("object {}: {}", id, err))?;
    Ok(())
}

fn apply_to_index(index: &mut RepositoryIndex, seg: u64, offset: u64, entry: &SegmentEntry) {
    match entry.tag {
        segment::EntryTag::Put => {
            index.set(
                entry.id.expect("put entries carry ids"),
                SegmentDescriptor {
                    segment: seg,
                    offset,
                    len: entry.framed_len(),
                },
            );
        }
        segment::EntryTag::Delete => {
            index.remove(entry.id.expect("delete entries carry ids"));
        }
        segment::EntryTag::Commit => {}
    }
}

/// Scans a segment, skipping over corrupt stretches to find later valid
/// entries (byte-by-byte resynchronisation)
fn salvage_segment(path: &Path) -> Result<Vec<SegmentEntry>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut entries = Vec::new();
    let mut offset = segment::HEADER_SIZE.min(file_len);
    while offset < file_len {
        file.seek(SeekFrom::Start(offset))?;
        match segment::read_entry(&mut file, offset) {
            Ok(Some(entry)) => {
                offset += u64::from(entry.framed_len());
                entries.push(entry);
            }
            Ok(None) => break,
            Err(_) => {
                // Slide forward one byte and try to lock on again
                offset += 1;
            }
        }
    }
    Ok(entries)
}

impl Repository {
    /// Checks the repository's storage layer, optionally repairing it.
    ///
    /// See [`CheckOptions`]; returns the findings rather than failing on
    /// the first problem, so a single run reports everything it saw.
    pub fn check(&mut self, options: &CheckOptions) -> Result<CheckReport> {
        if options.repair {
            self.ensure_writable()?;
            if options.max_duration.is_some() {
                return Err(RepositoryError::Usage(
                    "repair cannot be combined with a bounded check".to_string(),
                ));
            }
        }
        let started = Instant::now();
        let mut report = CheckReport {
            complete: true,
            ..CheckReport::default()
        };
        let data_dir = self.path.join("data");
        let segments = segment::all_segments(&data_dir);
        let resume_after = if options.max_duration.is_some() {
            self.load_check_cursor()
        } else {
            None
        };

        // Repair rebuilds the index from what actually survives on disk
        let mut rebuilt = if options.repair {
            Some(RepositoryIndex::new())
        } else {
            None
        };

        for seg in segments {
            if let Some(cursor) = resume_after {
                if seg <= cursor {
                    continue;
                }
            }
            let seg_path =
                segment::segment_path(&data_dir, seg, self.config.segments_per_directory);

            let mut reader = match segment::SegmentReader::open(File::open(&seg_path)?) {
                Ok(reader) => reader,
                Err(err) => {
                    let message = format!("segment {}: {}", seg, err);
                    error!("{}", message);
                    report.errors.push(message);
                    if let Some(index) = rebuilt.as_mut() {
                        self.salvage_and_remove(&seg_path, seg, index, &mut report)?;
                    }
                    report.segments_checked += 1;
                    continue;
                }
            };

            // Stream the entries once; only a damaged segment (under
            // repair) is read a second, deeper time
            let mut failed: Vec<ChunkId> = Vec::new();
            let scan = {
                let verify = options.verify_data;
                let key = &self.key;
                let rebuilt = &mut rebuilt;
                let errors = &mut report.errors;
                let verified = &mut report.objects_verified;
                let failed = &mut failed;
                reader.scan_entries(|offset, entry| {
                    let mut ok = true;
                    if verify && entry.tag == segment::EntryTag::Put {
                        match verify_put_entry(key, &entry) {
                            Ok(()) => *verified += 1,
                            Err(reason) => {
                                let message =
                                    format!("segment {} offset {}: {}", seg, offset, reason);
                                error!("{}", message);
                                errors.push(message);
                                failed.push(entry.id.expect("put entries carry ids"));
                                ok = false;
                            }
                        }
                    }
                    if ok {
                        if let Some(index) = rebuilt.as_mut() {
                            apply_to_index(index, seg, offset, &entry);
                        }
                    }
                    Ok(())
                })?
            };
            drop(reader);

            if let Some((offset, reason)) = &scan.corruption {
                let message = format!("segment {} offset {}: {}", seg, offset, reason);
                error!("{}", message);
                report.errors.push(message);
                if rebuilt.is_some() {
                    // The streaming pass already applied this segment's
                    // valid prefix; rebuild it from a clean salvage instead
                    let mut index = rebuilt.take().expect("checked above");
                    drop_segment_from_index(&mut index, seg);
                    self.salvage_and_remove(&seg_path, seg, &mut index, &mut report)?;
                    rebuilt = Some(index);
                }
            } else if options.repair && !failed.is_empty() {
                // Unverifiable objects in an otherwise intact segment: drop
                // them from the index and tombstone them, so a replay from
                // scratch does not resurrect them
                let index = rebuilt.as_mut().expect("repair implies rebuild");
                for id in failed {
                    index.remove(id);
                    let entry = SegmentEntry::delete(id);
                    let new_seg = self.writer_for(u64::from(entry.framed_len()))?;
                    self.writer.as_mut().unwrap().append(&entry)?;
                    self.hints
                        .record_put(new_seg, u64::from(entry.framed_len()));
                }
            }

            report.segments_checked += 1;
            if let Some(limit) = options.max_duration {
                self.save_check_cursor(seg)?;
                if started.elapsed() >= limit {
                    info!("Bounded check stopping after segment {}", seg);
                    report.complete = false;
                    return Ok(report);
                }
            }
        }

        if let Some(index) = rebuilt {
            self.index = index;
            self.commit()?;
            // A repair that rewrote nothing has no open segment; persist
            // the rebuilt snapshots regardless
            self.index.save(&self.path, self.txn_segment)?;
            self.hints.save(&self.path, self.txn_segment)?;
            info!("Repair rebuilt the index with {} objects", self.index.len());
        }
        if options.max_duration.is_some() && report.complete {
            let _ = remove_file(self.path.join(CHECK_CURSOR_FILE));
        }
        Ok(report)
    }

    /// Deep-salvages a damaged segment: verified entries move into fresh
    /// segments, then the damaged file is removed
    fn salvage_and_remove(
        &mut self,
        seg_path: &Path,
        seg: u64,
        index: &mut RepositoryIndex,
        report: &mut CheckReport,
    ) -> Result<()> {
        let entries = salvage_segment(seg_path)?;
        let mut moved = 0_usize;
        for entry in entries {
            if entry.tag == segment::EntryTag::Put {
                if let Err(reason) = verify_put_entry(&self.key, &entry) {
                    let message = format!("segment {}: dropping entry: {}", seg, reason);
                    error!("{}", message);
                    report.errors.push(message);
                    continue;
                }
            }
            self.requeue_salvaged(index, entry)?;
            moved += 1;
        }
        remove_file(seg_path)?;
        self.readers.pop(&seg);
        self.hints.forget_segment(seg);
        warn!(
            "segment {}: salvaged {} entries, removed damaged file",
            seg, moved
        );
        Ok(())
    }

    /// Re-appends a salvaged entry into the current writer segment
    fn requeue_salvaged(
        &mut self,
        index: &mut RepositoryIndex,
        entry: SegmentEntry,
    ) -> Result<()> {
        match entry.tag {
            segment::EntryTag::Put => {
                let id = entry.id.expect("put entries carry ids");
                let len = entry.framed_len();
                let seg = self.writer_for(u64::from(len))?;
                let offset = self.writer.as_mut().unwrap().append(&entry)?;
                index.set(
                    id,
                    SegmentDescriptor {
                        segment: seg,
                        offset,
                        len,
                    },
                );
                self.hints.record_put(seg, u64::from(len));
            }
            segment::EntryTag::Delete => {
                let id = entry.id.expect("delete entries carry ids");
                index.remove(id);
                let seg = self.writer_for(u64::from(entry.framed_len()))?;
                self.writer.as_mut().unwrap().append(&entry)?;
                self.hints
                    .record_put(seg, u64::from(entry.framed_len()));
            }
            segment::EntryTag::Commit => {}
        }
        Ok(())
    }

    fn load_check_cursor(&self) -> Option<u64> {
        let file = File::open(self.path.join(CHECK_CURSOR_FILE)).ok()?;
        let cursor: CheckCursor = rmp_serde::decode::from_read(file).ok()?;
        if cursor.repository == self.config.id {
            Some(cursor.segment)
        } else {
            None
        }
    }

    fn save_check_cursor(&self, seg: u64) -> Result<()> {
        let cursor = CheckCursor {
            repository: self.config.id,
            segment: seg,
        };
        let tmp = self.path.join("checkpoint.check.tmp");
        {
            let mut file = File::create(&tmp)?;
            rmp_serde::encode::write(&mut file, &cursor)?;
        }
        std::fs::rename(tmp, self.path.join(CHECK_CURSOR_FILE))?;
        Ok(())
    }
}

/// Removes every index entry that points into the given segment
fn drop_segment_from_index(index: &mut RepositoryIndex, seg: u64) {
    let stale: Vec<ChunkId> = index
        .iter()
        .filter(|(_, location)| location.segment == seg)
        .map(|(id, _)| *id)
        .collect();
    for id in stale {
        index.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::repository::KeyMode;
    use cairn_core::repository::{ChunkSettings, ObjectKind};
    use std::io::{Read, Write};
    use tempfile::tempdir;

    fn open_test_repo(base: &Path) -> (EngineConfig, std::path::PathBuf, Repository) {
        let engine = EngineConfig::isolated(&base.join("client"));
        let repo_path = base.join("repo");
        let repo = Repository::init(
            &repo_path,
            &engine,
            KeyMode::Repokey,
            ChunkSettings::lightweight(),
            b"pw",
            true,
        )
        .unwrap();
        (engine, repo_path, repo)
    }

    fn corrupt_one_byte(repo_path: &Path, segment: u64, offset_from_end: u64) {
        let seg_path = segment::segment_path(&repo_path.join("data"), segment, 1000);
        let mut contents = Vec::new();
        File::open(&seg_path)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        let target = contents.len() - offset_from_end as usize;
        contents[target] ^= 0x01;
        let mut file = File::create(&seg_path).unwrap();
        file.write_all(&contents).unwrap();
    }

    #[test]
    fn clean_repository_checks_clean() {
        let dir = tempdir().unwrap();
        let (_engine, _path, mut repo) = open_test_repo(dir.path());
        repo.put_data(b"some data", ObjectKind::Data).unwrap();
        repo.put_data(b"more data", ObjectKind::Data).unwrap();
        repo.commit().unwrap();

        let report = repo
            .check(&CheckOptions {
                verify_data: true,
                ..CheckOptions::default()
            })
            .unwrap();
        assert!(report.is_clean());
        assert!(report.complete);
        assert_eq!(report.objects_verified, 2);
    }

    #[test]
    fn corruption_is_reported() {
        let dir = tempdir().unwrap();
        let (engine, path, mut repo) = open_test_repo(dir.path());
        repo.put_data(&[7_u8; 4096], ObjectKind::Data).unwrap();
        repo.commit().unwrap();
        drop(repo);

        // Flip a byte inside the put entry's payload (well before the
        // trailing commit entry)
        corrupt_one_byte(&path, 1, 200);

        let mut repo = Repository::open(&path, &engine, Some(b"pw"), true).unwrap();
        let report = repo.check(&CheckOptions::default()).unwrap();
        assert!(!report.is_clean());
    }

    #[test]
    fn repair_salvages_the_readable_entries() {
        let dir = tempdir().unwrap();
        let (engine, path, mut repo) = open_test_repo(dir.path());
        let (id_a, _, _) = repo.put_data(&[1_u8; 2048], ObjectKind::Data).unwrap();
        let (id_b, _, _) = repo.put_data(&[2_u8; 2048], ObjectKind::Data).unwrap();
        repo.commit().unwrap();
        drop(repo);

        // Damage the second object's payload; the first should survive
        // repair, the second should be dropped
        corrupt_one_byte(&path, 1, 500);

        let mut repo = Repository::open(&path, &engine, Some(b"pw"), true).unwrap();
        let report = repo
            .check(&CheckOptions {
                repair: true,
                ..CheckOptions::default()
            })
            .unwrap();
        assert!(!report.is_clean());

        assert!(repo.contains(id_a));
        assert!(!repo.contains(id_b));
        let (_, plain) = repo.get_data(id_a).unwrap();
        assert_eq!(plain, vec![1_u8; 2048]);

        // After repair, a fresh check is clean
        let report = repo
            .check(&CheckOptions {
                verify_data: true,
                ..CheckOptions::default()
            })
            .unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn bounded_check_resumes_from_cursor() {
        let dir = tempdir().unwrap();
        let (_engine, _path, mut repo) = open_test_repo(dir.path());
        repo.config.max_segment_size = 4096;
        for i in 0..6_u8 {
            repo.put_data(&vec![i; 2048], ObjectKind::Data).unwrap();
        }
        repo.commit().unwrap();

        // A zero-duration bound checks exactly one segment per run
        let mut checked = 0;
        let mut runs = 0;
        loop {
            let report = repo
                .check(&CheckOptions {
                    max_duration: Some(Duration::from_secs(0)),
                    ..CheckOptions::default()
                })
                .unwrap();
            checked += report.segments_checked;
            runs += 1;
            assert!(report.is_clean());
            if report.complete {
                break;
            }
        }
        assert!(runs > 1);
        let total_segments = segment::all_segments(&repo.path().join("data")).len();
        assert_eq!(checked, total_segments);
    }
}
