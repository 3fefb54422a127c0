/*!
Rewriting an archive with different chunker or compression parameters.

Each item's content is streamed out of the old chunk list, re-chunked with
the new parameters, and stored again; items themselves are preserved
identically. Operates one archive at a time: the manifest pointer moves to
the rebuilt metadata object and the old object graph is dereferenced.
*/
use super::{ItemStreamReader, ItemStreamWriter, Result};
use crate::cache::ChunkIndex;
use crate::manifest::Manifest;
use crate::repository::Repository;
use cairn_core::archive::{ChunkRef, ChunkerParams, Item, ItemType};
use cairn_core::repository::{Compression, ObjectKind};
use cairn_chunker::{BuzHash, Chunker};

use tracing::{info, instrument};

use std::io::{Seek, SeekFrom, Write};

/// Re-chunks and re-stores the named archive.
///
/// `chunker_params` and `compression` default to the archive's existing
/// parameters and the repository's configured compression when `None`.
/// The chunks index must be in sync with the manifest before calling.
#[instrument(skip(repo, manifest, chunk_index))]
pub fn recreate(
    repo: &mut Repository,
    manifest: &mut Manifest,
    chunk_index: &mut ChunkIndex,
    name: &str,
    chunker_params: Option<ChunkerParams>,
    compression: Option<Compression>,
) -> Result<()> {
    let (old_id, old_record) = super::load_archive_by_name(repo, manifest, name)?;
    let params = chunker_params.unwrap_or(old_record.chunker);
    let chunker = BuzHash::new(
        repo.key().chunker_nonce(),
        params.min_size as usize,
        params.max_size as usize,
        params.mask_bits,
        params.window_size,
    );
    let old_compression = repo.config.settings.compression;
    if let Some(compression) = compression {
        repo.config.settings.compression = compression;
    }

    let result = recreate_inner(
        repo,
        manifest,
        chunk_index,
        name,
        old_id,
        &old_record,
        params,
        chunker,
    );
    repo.config.settings.compression = old_compression;
    result
}

#[allow(clippy::too_many_arguments)]
fn recreate_inner(
    repo: &mut Repository,
    manifest: &mut Manifest,
    chunk_index: &mut ChunkIndex,
    name: &str,
    old_id: cairn_core::repository::ChunkId,
    old_record: &cairn_core::archive::ArchiveRecord,
    params: ChunkerParams,
    chunker: BuzHash,
) -> Result<()> {
    let mut writer = ItemStreamWriter::new(chunker);
    let mut old_data_refs: Vec<ChunkRef> = Vec::new();
    let mut reader = ItemStreamReader::new(old_record.item_stream.clone());

    while let Some(mut item) = reader.next_item(repo)? {
        if item.item_type == ItemType::RegularFile && !item.chunks.is_empty() {
            old_data_refs.extend(item.chunks.iter().copied());
            item.chunks = rechunk_content(repo, chunk_index, &item, chunker)?;
            item.chunks_healthy = None;
        }
        writer.push(repo, &item)?;
    }
    let (meta_ids, flushed) = writer.finish(repo)?;
    for (chunk, _) in flushed {
        if chunk_index.contains(chunk.id) {
            chunk_index.add_ref(chunk.id);
        } else {
            chunk_index.insert(chunk.id, chunk.size, chunk.csize);
        }
    }

    let mut new_record = old_record.clone();
    new_record.item_stream = meta_ids;
    new_record.chunker = params;
    let bytes = rmp_serde::to_vec(&new_record)?;
    let (new_id, existing, csize) = repo.put_data(&bytes, ObjectKind::Archive)?;
    if chunk_index.contains(new_id) {
        chunk_index.add_ref(new_id);
    } else {
        chunk_index.insert(new_id, bytes.len() as u32, if existing { 0 } else { csize });
    }

    // Swap the manifest pointer, then release the old object graph
    let pointer = manifest.remove_archive(name)?;
    manifest.add_archive(name, new_id, pointer.time)?;
    manifest.store(repo)?;

    for chunk in old_data_refs {
        if chunk_index.del_ref(chunk.id) {
            super::delete_if_present(repo, chunk.id)?;
        }
    }
    for meta_id in &old_record.item_stream {
        if chunk_index.del_ref(*meta_id) {
            super::delete_if_present(repo, *meta_id)?;
        }
    }
    if chunk_index.del_ref(old_id) {
        super::delete_if_present(repo, old_id)?;
    }
    repo.commit()?;
    chunk_index.set_manifest_stamp(manifest.stamp());
    info!("Recreated archive {} with new parameters", name);
    Ok(())
}

/// Streams an item's content through the new chunker, spooling it to a
/// temporary file so the (owned) chunker can read it back
fn rechunk_content(
    repo: &mut Repository,
    chunk_index: &mut ChunkIndex,
    item: &Item,
    chunker: BuzHash,
) -> Result<Vec<ChunkRef>> {
    let mut spool = tempfile::tempfile()?;
    for chunk in &item.chunks {
        let (_, data) = repo.get_data(chunk.id)?;
        spool.write_all(&data)?;
    }
    spool.seek(SeekFrom::Start(0))?;

    let mut refs = Vec::new();
    for chunk in chunker.chunk(spool) {
        let data = chunk?;
        let (stored, _) = super::store_counted(repo, chunk_index, &data)?;
        refs.push(stored);
    }
    Ok(refs)
}
