/*!
Consistency checking of the object graph: manifest → archives → item
streams → data chunks.

Every object the manifest transitively references must be present. Repair
drops archives whose metadata object is gone, rebuilds item streams around
missing meta chunks (losing the items they carried), and substitutes
all-zero replacement chunks for unrecoverable data chunks, preserving the
original chunk list so the item can reconverge if the real chunk ever
reappears (for example, when the same file is backed up again).
*/
use super::{ItemStreamReader, ItemStreamWriter, Result};
use crate::manifest::Manifest;
use crate::repository::Repository;
use cairn_core::archive::{ArchiveRecord, ChunkRef, Item};
use cairn_core::repository::{ChunkId, ObjectKind};
use cairn_chunker::BuzHash;

use tracing::{error, info, instrument, warn};

/// Findings of an archive-graph check
#[derive(Debug, Default)]
pub struct ArchiveCheckReport {
    pub archives_checked: usize,
    pub errors: Vec<String>,
    /// Items whose missing chunks were replaced by zero chunks
    pub items_patched: usize,
    /// Previously patched items whose real chunks reappeared
    pub items_reconverged: usize,
    /// Archives dropped because their metadata object was unrecoverable
    pub archives_removed: Vec<String>,
}

impl ArchiveCheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verifies (and with `repair`, patches) every archive reachable from the
/// manifest.
///
/// Repair rewrites affected archives in place: their manifest pointers
/// move to rebuilt metadata objects. The chunks index resynchronises
/// automatically afterwards, since the manifest stamp changes.
#[instrument(skip(repo, manifest))]
pub fn check_archives(
    repo: &mut Repository,
    manifest: &mut Manifest,
    repair: bool,
) -> Result<ArchiveCheckReport> {
    let mut report = ArchiveCheckReport::default();
    let mut rewrites: Vec<(String, ChunkId)> = Vec::new();
    let mut removals: Vec<String> = Vec::new();

    for entry in manifest.archives() {
        report.archives_checked += 1;
        let record = match super::load_archive_record(repo, entry.id) {
            Ok(record) => record,
            Err(err) => {
                let message = format!("archive {}: metadata unreadable: {}", entry.name, err);
                error!("{}", message);
                report.errors.push(message);
                if repair {
                    removals.push(entry.name.clone());
                }
                continue;
            }
        };

        // Which meta chunks survive decides whether the stream is intact
        let missing_meta: Vec<ChunkId> = record
            .item_stream
            .iter()
            .copied()
            .filter(|id| !repo.contains(*id))
            .collect();
        for id in &missing_meta {
            let message = format!(
                "archive {}: item stream chunk {} is missing",
                entry.name, id
            );
            error!("{}", message);
            report.errors.push(message);
        }

        let outcome = check_items(repo, &entry.name, &record, &missing_meta, repair, &mut report)?;

        if repair {
            if let Some(items) = outcome {
                let new_id = rewrite_archive(repo, &record, items)?;
                rewrites.push((entry.name.clone(), new_id));
            }
        }
    }

    if repair && (!rewrites.is_empty() || !removals.is_empty()) {
        for name in removals {
            warn!("Removing archive {} (metadata unrecoverable)", name);
            manifest.remove_archive(&name)?;
            report.archives_removed.push(name);
        }
        for (name, new_id) in rewrites {
            let pointer = manifest.remove_archive(&name)?;
            manifest.add_archive(&name, new_id, pointer.time)?;
            info!("Rewrote archive {} during repair", name);
        }
        manifest.store(repo)?;
        repo.commit()?;
    }
    Ok(report)
}

/// Walks an archive's items, verifying chunk presence. Returns the
/// (possibly patched) item list when a repair rewrite is needed.
fn check_items(
    repo: &mut Repository,
    name: &str,
    record: &ArchiveRecord,
    missing_meta: &[ChunkId],
    repair: bool,
    report: &mut ArchiveCheckReport,
) -> Result<Option<Vec<Item>>> {
    let live_meta: Vec<ChunkId> = record
        .item_stream
        .iter()
        .copied()
        .filter(|id| !missing_meta.contains(id))
        .collect();
    let mut items: Vec<Item> = Vec::new();
    let mut needs_rewrite = !missing_meta.is_empty();

    let mut reader = ItemStreamReader::new(live_meta);
    loop {
        let item = match reader.next_item(repo) {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(err) => {
                // A gap in the stream desynchronises the decoder; keep what
                // was salvaged up to here
                let message = format!("archive {}: item stream truncated: {}", name, err);
                error!("{}", message);
                report.errors.push(message);
                needs_rewrite = true;
                break;
            }
        };
        let item = match verify_item(repo, name, item, repair, report)? {
            ItemOutcome::Intact(item) => item,
            ItemOutcome::Patched(item) => {
                needs_rewrite = true;
                item
            }
        };
        if repair {
            items.push(item);
        }
    }

    Ok(if repair && needs_rewrite {
        Some(items)
    } else {
        None
    })
}

enum ItemOutcome {
    Intact(Item),
    Patched(Item),
}

/// Verifies one item's chunk references, patching with zero chunks or
/// reconverging as appropriate
fn verify_item(
    repo: &mut Repository,
    archive: &str,
    mut item: Item,
    repair: bool,
    report: &mut ArchiveCheckReport,
) -> Result<ItemOutcome> {
    // Reconvergence first: a previously patched item whose real chunks all
    // came back gets its healthy list restored
    if let Some(healthy) = &item.chunks_healthy {
        if healthy.iter().all(|c| repo.contains(c.id)) {
            if repair {
                item.chunks = item.chunks_healthy.take().expect("just checked");
                report.items_reconverged += 1;
                info!("{}: {} reconverged, all chunks are back", archive, item.path);
                return Ok(ItemOutcome::Patched(item));
            }
        }
    }

    let missing: Vec<usize> = item
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| !repo.contains(c.id))
        .map(|(i, _)| i)
        .collect();
    if missing.is_empty() {
        return Ok(ItemOutcome::Intact(item));
    }
    let message = format!(
        "archive {}: item {} references {} missing chunks",
        archive,
        item.path,
        missing.len()
    );
    error!("{}", message);
    report.errors.push(message);
    if !repair {
        return Ok(ItemOutcome::Intact(item));
    }

    // Substitute all-zero replacement chunks, remembering the original list
    // so the item can heal later
    if item.chunks_healthy.is_none() {
        item.chunks_healthy = Some(item.chunks.clone());
    }
    for index in missing {
        let original = item.chunks[index];
        let zeros = vec![0_u8; original.size as usize];
        let (zero_id, _, csize) = repo.put_data(&zeros, ObjectKind::Data)?;
        item.chunks[index] = ChunkRef {
            id: zero_id,
            size: original.size,
            csize,
        };
    }
    report.items_patched += 1;
    warn!(
        "{}: {} marked broken, missing chunks replaced with zeros",
        archive, item.path
    );
    Ok(ItemOutcome::Patched(item))
}

/// Serialises a patched item list into a fresh stream and stores a new
/// metadata object carrying it
fn rewrite_archive(
    repo: &mut Repository,
    record: &ArchiveRecord,
    items: Vec<Item>,
) -> Result<ChunkId> {
    let params = record.chunker;
    let chunker = BuzHash::new(
        repo.key().chunker_nonce(),
        params.min_size as usize,
        params.max_size as usize,
        params.mask_bits,
        params.window_size,
    );
    let mut writer = ItemStreamWriter::new(chunker);
    for item in &items {
        writer.push(repo, item)?;
    }
    let (meta_ids, _) = writer.finish(repo)?;

    let mut new_record = record.clone();
    new_record.item_stream = meta_ids;
    let bytes = rmp_serde::to_vec(&new_record)?;
    let (id, _, _) = repo.put_data(&bytes, ObjectKind::Archive)?;
    Ok(id)
}
