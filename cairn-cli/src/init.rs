use crate::cli::{settings_for_init, Cipher, KeyLocation, Opt};
use crate::util;

use anyhow::{anyhow, Result};
use cairn::config::EngineConfig;
use cairn::manifest::{Manifest, ManifestConfig};
use cairn::repository::{KeyMode, Repository};

use std::path::PathBuf;

/// Creates a new repository and writes its initial, empty manifest
pub fn init(options: &Opt) -> Result<i32> {
    let (repository, key_mode, cipher, compression, id_hash, no_tam) = match &options.command {
        crate::cli::Command::Init {
            repository,
            key_mode,
            cipher,
            compression,
            id_hash,
            no_tam,
        } => (
            repository.clone(),
            *key_mode,
            *cipher,
            compression.clone(),
            *id_hash,
            *no_tam,
        ),
        _ => unreachable!(),
    };

    let engine = EngineConfig::from_env()?;
    let path = util::repository_path(&engine, &repository)?;
    let settings = settings_for_init(cipher, &compression, id_hash)?;
    let key_mode: KeyMode = key_mode.into();

    if matches!(key_mode, KeyMode::None) && !matches!(cipher, Cipher::None) {
        return Err(anyhow!(
            "an encrypted repository needs its key stored somewhere; pick repokey or keyfile"
        ));
    }
    if !matches!(key_mode, KeyMode::None) && matches!(cipher, Cipher::None) {
        return Err(anyhow!(
            "key mode {:?} makes no sense without encryption",
            key_mode
        ));
    }

    let passphrase = if matches!(key_mode, KeyMode::None) {
        String::new()
    } else {
        util::passphrase_or_prompt(&engine, true)?
    };

    let mut repo = Repository::init(
        &PathBuf::from(&path),
        &engine,
        key_mode,
        settings,
        passphrase.as_bytes(),
        !no_tam,
    )?;

    let mut manifest = Manifest::empty(ManifestConfig::default());
    manifest.store(&mut repo)?;
    repo.commit()?;

    println!("Initialized repository {} at {:?}", repo.config.id, path);
    if matches!(key_mode, KeyMode::Keyfile) {
        println!(
            "Key file written to {:?}; keep it safe, the repository is useless without it",
            cairn::repository::keys::keyfile_path(&engine, &repo.config)
        );
    }
    Ok(0)
}
