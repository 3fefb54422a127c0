use crate::cli::{Command, KeyCommand, Opt};
use crate::util;

use anyhow::Result;
use cairn::config::EngineConfig;
use cairn::repository::keys;

/// Key management subcommands
pub fn key(options: &Opt) -> Result<i32> {
    let command = match &options.command {
        Command::Key(command) => command,
        _ => unreachable!(),
    };
    match command {
        KeyCommand::ChangePassphrase { repository } => change_passphrase(repository),
    }
}

/// Re-wraps the repository key under a new passphrase.
///
/// The new passphrase comes from `CAIRN_NEW_PASSPHRASE` when set, an
/// interactive prompt otherwise.
fn change_passphrase(repository: &str) -> Result<i32> {
    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, repository)?;
    let mut repo = util::open_repository(&path, &engine, true)?;

    let new_passphrase = match engine.new_passphrase.clone() {
        Some(value) => value,
        None => util::prompt_passphrase(true)?,
    };

    let mode = repo.key_mode();
    let key = repo.key().clone();
    let encryption = repo.config.settings.encryption;
    keys::change_passphrase(
        mode,
        &key,
        &mut repo.config,
        &engine,
        encryption,
        new_passphrase.as_bytes(),
    )?;
    repo.config.save(repo.path())?;
    println!("Passphrase changed ({} mode)", mode);
    Ok(0)
}
