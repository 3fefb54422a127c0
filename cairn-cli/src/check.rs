use crate::cli::{Command, Opt};
use crate::util;

use anyhow::{Context, Result};
use cairn::archive::check_archives;
use cairn::config::EngineConfig;
use cairn::manifest::Manifest;
use cairn::repository::CheckOptions;

/// Verifies the repository's storage layer and (unless told otherwise)
/// the archive object graph
pub fn check(options: &Opt) -> Result<i32> {
    let (repository, verify_data, repair, repository_only) = match &options.command {
        Command::Check {
            repository,
            verify_data,
            repair,
            repository_only,
            ..
        } => (repository, *verify_data, *repair, *repository_only),
        _ => unreachable!(),
    };
    let max_duration = options.command.max_duration();

    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, repository)?;
    // Repair mutates; a plain check only needs to read
    let mut repo = util::open_repository(&path, &engine, repair)?;

    let storage_options = CheckOptions {
        verify_data,
        repair,
        max_duration,
    };
    let storage_report = repo.check(&storage_options)?;
    println!(
        "Storage check: {} segments, {} objects verified, {} problems",
        storage_report.segments_checked,
        storage_report.objects_verified,
        storage_report.errors.len()
    );
    for error in &storage_report.errors {
        eprintln!("  {}", error);
    }
    if !storage_report.complete {
        println!("Storage check is partial; rerun to continue from the saved cursor");
    }

    let mut problems = storage_report.errors.len();
    if !repository_only && storage_report.complete {
        let mut manifest =
            Manifest::load(&mut repo).context("manifest failed authentication or loading")?;
        let archive_report = check_archives(&mut repo, &mut manifest, repair)?;
        println!(
            "Archive check: {} archives, {} problems, {} items patched, {} reconverged",
            archive_report.archives_checked,
            archive_report.errors.len(),
            archive_report.items_patched,
            archive_report.items_reconverged
        );
        for error in &archive_report.errors {
            eprintln!("  {}", error);
        }
        for name in &archive_report.archives_removed {
            eprintln!("  removed unrecoverable archive {}", name);
        }
        problems += archive_report.errors.len();
    }

    if problems > 0 {
        Ok(1)
    } else {
        println!("Repository is consistent");
        Ok(0)
    }
}
