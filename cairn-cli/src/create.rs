use crate::cli::{split_archive_location, Command, Opt};
use crate::util;

use anyhow::{Context, Result};
use cairn::archive::{substitute_placeholders, ArchiveOptions, ArchiveWriter};
use cairn::walker;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use std::time::Duration;

fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad pattern {:?}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Creates a new archive from the given source paths
pub fn create(options: &Opt) -> Result<i32> {
    let (archive, paths, exclude, comment, checkpoint_interval, files_cache_suffix) =
        match &options.command {
            Command::Create {
                archive,
                paths,
                exclude,
                comment,
                checkpoint_interval,
                files_cache_suffix,
            } => (
                archive,
                paths,
                exclude,
                comment.clone(),
                *checkpoint_interval,
                files_cache_suffix.clone(),
            ),
            _ => unreachable!(),
        };
    let (repository, name_template) = split_archive_location(archive)?;
    let name = substitute_placeholders(&name_template)?;
    let excludes = build_exclude_set(exclude)?;

    let mut session = util::open_session(&repository, true)?;
    let mut chunk_index = util::load_chunk_index(&mut session)?;
    let mut files_index = util::load_files_index(&session, &files_cache_suffix)?;

    let archive_options = ArchiveOptions {
        comment,
        checkpoint_interval: Duration::from_secs(checkpoint_interval),
        files_cache_suffix: files_cache_suffix.clone(),
        consider_inode: true,
        command_line: std::env::args().collect::<Vec<_>>().join(" "),
    };

    let mut warnings = 0_usize;
    let record = {
        let mut writer = ArchiveWriter::new(
            &mut session.repo,
            &mut session.manifest,
            &mut chunk_index,
            &mut files_index,
            &name,
            archive_options,
        )?;
        for path in paths {
            for entry in walker::walk(path, |p| !excludes.is_match(p)) {
                if let Err(err) = writer.add_entry(&entry) {
                    match err {
                        cairn::archive::ArchiveError::IOError(err) => {
                            warn!("{}: {}", entry.stored_path, err);
                            warnings += 1;
                        }
                        fatal => return Err(fatal.into()),
                    }
                }
            }
        }
        writer.finish()?
    };

    chunk_index.save(&session.cache_dir)?;
    files_index.save(&session.cache_dir, &files_cache_suffix)?;

    println!("Created archive {}", record.name);
    println!("Files: {}", record.stats.nfiles);
    println!("Original size: {} bytes", record.stats.original_size);
    println!("Compressed size: {} bytes", record.stats.compressed_size);
    println!(
        "Deduplicated (new) size: {} bytes",
        record.stats.deduplicated_size
    );
    if warnings > 0 {
        eprintln!("Completed with {} warnings", warnings);
        return Ok(1);
    }
    Ok(0)
}
