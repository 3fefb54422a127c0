use crate::cli::{Command, Opt};
use crate::util;

use anyhow::{anyhow, Result};

/// Applies the retention policy to the repository's archives
pub fn prune(options: &Opt) -> Result<i32> {
    let (repository, dry_run) = match &options.command {
        Command::Prune {
            repository,
            dry_run,
            ..
        } => (repository, *dry_run),
        _ => unreachable!(),
    };
    let policy = options
        .command
        .prune_policy()
        .expect("prune command always has a policy");
    if policy.is_empty() {
        return Err(anyhow!(
            "refusing to prune with an empty policy; that would delete every archive"
        ));
    }

    let mut session = util::open_session(repository, true)?;
    let mut chunk_index = util::load_chunk_index(&mut session)?;

    let report = cairn::archive::prune(
        &mut session.repo,
        &mut session.manifest,
        &mut chunk_index,
        &policy,
        dry_run,
    )?;
    chunk_index.save(&session.cache_dir)?;

    let verb = if dry_run { "Would delete" } else { "Deleted" };
    for name in &report.deleted {
        println!("{} {}", verb, name);
    }
    for name in &report.kept {
        println!("Keeping {}", name);
    }
    Ok(0)
}
