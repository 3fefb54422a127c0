use crate::repository::ChunkId;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// Suffix marking checkpoint archives, which are hidden from normal listings
pub const CHECKPOINT_SUFFIX: &str = ".checkpoint";

/// Parameters of the content-defined chunker, carried in every archive so
/// that restore and recreate can reproduce the cut sequence
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkerParams {
    pub min_size: u32,
    pub max_size: u32,
    pub mask_bits: u32,
    pub window_size: u32,
}

impl Default for ChunkerParams {
    /// Defaults target an expected chunk size of 2^19 (512 KiB), with cut
    /// points constrained to [2^17, 2^21]
    fn default() -> ChunkerParams {
        ChunkerParams {
            min_size: 1 << 17,
            max_size: 1 << 21,
            mask_bits: 19,
            window_size: 4095,
        }
    }
}

/// Size accounting accumulated while an archive is written
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Number of file items
    pub nfiles: u64,
    /// Total plain-text bytes of all items
    pub original_size: u64,
    /// Stored bytes of all referenced chunks, deduplicated or not
    pub compressed_size: u64,
    /// Stored bytes of chunks first written by this archive
    pub deduplicated_size: u64,
}

/// The archive metadata object.
///
/// Serialised and stored as an ordinary object; the manifest maps the
/// archive name to this object's id. The item records themselves live in a
/// separate chunked stream whose chunk ids are listed here, so that archive
/// metadata deduplicates across snapshots.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ArchiveRecord {
    pub version: u32,
    pub name: String,
    pub comment: String,
    pub hostname: String,
    pub username: String,
    pub command_line: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// Ordered ids of the item-stream chunks
    pub item_stream: Vec<ChunkId>,
    pub chunker: ChunkerParams,
    pub stats: ArchiveStats,
}

impl ArchiveRecord {
    /// True when this archive is a checkpoint flushed mid-backup
    pub fn is_checkpoint(&self) -> bool {
        self.name.ends_with(CHECKPOINT_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let now = Local::now().with_timezone(Local::now().offset());
        let record = ArchiveRecord {
            version: 1,
            name: "nightly".to_string(),
            comment: String::new(),
            hostname: "build-host".to_string(),
            username: "operator".to_string(),
            command_line: "cairn create ::nightly /srv".to_string(),
            start: now,
            end: now,
            item_stream: vec![ChunkId::random_id(), ChunkId::random_id()],
            chunker: ChunkerParams::default(),
            stats: ArchiveStats::default(),
        };
        let bytes = rmp_serde::to_vec(&record).unwrap();
        let back: ArchiveRecord = rmp_serde::decode::from_read(&bytes[..]).unwrap();
        assert_eq!(record, back);
        assert!(!back.is_checkpoint());
    }

    #[test]
    fn checkpoint_detection() {
        let now = Local::now().with_timezone(Local::now().offset());
        let record = ArchiveRecord {
            version: 1,
            name: format!("nightly{}", CHECKPOINT_SUFFIX),
            comment: String::new(),
            hostname: String::new(),
            username: String::new(),
            command_line: String::new(),
            start: now,
            end: now,
            item_stream: Vec::new(),
            chunker: ChunkerParams::default(),
            stats: ArchiveStats::default(),
        };
        assert!(record.is_checkpoint());
    }
}
