use crate::cli::{parse_chunker_params, split_archive_location, Command, Opt};
use crate::util;

use anyhow::{anyhow, Result};
use cairn_core::repository::Compression;

/// Rewrites an archive with new chunker or compression parameters
pub fn recreate(options: &Opt) -> Result<i32> {
    let (archive, chunker_params, compression) = match &options.command {
        Command::Recreate {
            archive,
            chunker_params,
            compression,
        } => (archive, chunker_params.clone(), compression.clone()),
        _ => unreachable!(),
    };
    let (repository, name) = split_archive_location(archive)?;
    let params = chunker_params.as_deref().map(parse_chunker_params).transpose()?;
    let compression = compression
        .as_deref()
        .map(Compression::parse)
        .transpose()
        .map_err(|err| anyhow!("invalid compression spec: {}", err))?;

    let mut session = util::open_session(&repository, true)?;
    let mut chunk_index = util::load_chunk_index(&mut session)?;

    cairn::archive::recreate(
        &mut session.repo,
        &mut session.manifest,
        &mut chunk_index,
        &name,
        params,
        compression,
    )?;
    chunk_index.save(&session.cache_dir)?;
    println!("Recreated archive {}", name);
    Ok(0)
}
