use crate::cli::{split_archive_location, Command, Opt};
use crate::util;

use anyhow::Result;

/// Deletes one archive, reclaiming chunks nothing else references
pub fn delete(options: &Opt) -> Result<i32> {
    let archive = match &options.command {
        Command::Delete { archive } => archive,
        _ => unreachable!(),
    };
    let (repository, name) = split_archive_location(archive)?;
    let mut session = util::open_session(&repository, true)?;
    let mut chunk_index = util::load_chunk_index(&mut session)?;

    cairn::archive::delete_archive(
        &mut session.repo,
        &mut session.manifest,
        &mut chunk_index,
        &name,
    )?;
    chunk_index.save(&session.cache_dir)?;
    println!("Deleted archive {}", name);
    Ok(0)
}
