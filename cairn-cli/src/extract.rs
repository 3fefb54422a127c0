use crate::cli::{split_archive_location, Command, Opt};
use crate::util;

use anyhow::{Context, Result};
use globset::{Glob, GlobSetBuilder};

/// Restores an archive into the target directory
pub fn extract(options: &Opt) -> Result<i32> {
    let (archive, target, include) = match &options.command {
        Command::Extract {
            archive,
            target,
            include,
        } => (archive, target.clone(), include),
        _ => unreachable!(),
    };
    let (repository, name) = split_archive_location(archive)?;

    let includes = if include.is_empty() {
        None
    } else {
        let mut builder = GlobSetBuilder::new();
        for pattern in include {
            builder
                .add(Glob::new(pattern).with_context(|| format!("bad pattern {:?}", pattern))?);
        }
        Some(builder.build()?)
    };

    let mut session = util::open_session(&repository, false)?;
    let report = cairn::archive::extract(
        &mut session.repo,
        &session.manifest,
        &name,
        &target,
        |path| match &includes {
            Some(set) => set.is_match(path),
            None => true,
        },
    )?;

    println!("Restored {} items to {:?}", report.items_restored, target);
    if !report.warnings.is_empty() {
        for warning in &report.warnings {
            eprintln!("Warning: {}", warning);
        }
        return Ok(1);
    }
    Ok(0)
}
