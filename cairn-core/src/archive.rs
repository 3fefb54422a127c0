/*!
Serialised records that make up an archive: the per-file item records that
flow through the item stream, and the archive metadata object the manifest
points at.
*/

pub mod item;
pub mod record;

pub use item::{ChunkRef, Item, ItemType};
pub use record::{ArchiveRecord, ArchiveStats, ChunkerParams};
