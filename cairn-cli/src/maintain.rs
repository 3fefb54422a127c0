use crate::cli::{Command, Opt};
use crate::util;

use anyhow::Result;
use cairn::config::EngineConfig;
use cairn::manifest::Manifest;
use cairn::repository::ExclusiveLock;

/// Rewrites sparse segments and reports the space reclaimed
pub fn compact(options: &Opt) -> Result<i32> {
    let repository = match &options.command {
        Command::Compact { repository } => repository,
        _ => unreachable!(),
    };
    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, repository)?;
    let mut repo = util::open_repository(&path, &engine, true)?;
    let report = repo.compact()?;
    println!(
        "Compacted {} segments, reclaimed {} bytes",
        report.segments_compacted, report.bytes_reclaimed
    );
    Ok(0)
}

/// Attaches an authentication tag to a manifest from before TAM was
/// required
pub fn tam_upgrade(options: &Opt) -> Result<i32> {
    let repository = match &options.command {
        Command::TamUpgrade { repository } => repository,
        _ => unreachable!(),
    };
    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, repository)?;
    let mut repo = util::open_repository(&path, &engine, true)?;
    Manifest::upgrade_tam(&mut repo)?;
    println!("Manifest authentication tag attached");
    Ok(0)
}

/// Forcibly removes the exclusive lock; for when a holder is known dead
/// but cannot be proven so from this host
pub fn break_lock(options: &Opt) -> Result<i32> {
    let repository = match &options.command {
        Command::BreakLock { repository } => repository,
        _ => unreachable!(),
    };
    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, repository)?;
    match ExclusiveLock::current_owner(&path)? {
        Some(owner) => {
            eprintln!(
                "Breaking lock held by {} (pid {}, since {})",
                owner.host_id, owner.pid, owner.timestamp
            );
        }
        None => println!("No exclusive lock present"),
    }
    ExclusiveLock::force_break(&path)?;
    Ok(0)
}

/// Serves repository operations over stdin/stdout; the client end invokes
/// this through its remote transport
pub fn serve(_options: &Opt) -> Result<i32> {
    let engine = EngineConfig::from_env()?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    cairn::rpc::serve(&engine, stdin.lock(), stdout.lock())?;
    Ok(0)
}
