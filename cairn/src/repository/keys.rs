/*!
Key locations and unlock.

Three modes: `none` (no encryption, blank key material, ids reduce to an
unkeyed hash), `repokey` (wrapped key stored inside the repository config),
and `keyfile` (wrapped key stored in the client's key directory, so the
repository alone is not enough to decrypt anything).
*/
use crate::config::EngineConfig;
use crate::repository::config::RepoConfig;
use cairn_core::repository::{EncryptedKey, Encryption, Key, KeyError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use std::fmt;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("I/O error on key file")]
    IOError(#[from] std::io::Error),
    #[error("Key unwrap failed (wrong passphrase or corrupt key)")]
    KeyError(#[from] KeyError),
    #[error("Key file is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Repository is encrypted but no key file was found at {0}")]
    NoKeyFound(PathBuf),
    #[error("Repository is encrypted and a passphrase is required")]
    PassphraseRequired,
}

type Result<T> = std::result::Result<T, KeyManagerError>;

/// How a repository's key material is stored
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyMode {
    None,
    Repokey,
    Keyfile,
}

impl fmt::Display for KeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMode::None => write!(f, "none"),
            KeyMode::Repokey => write!(f, "repokey"),
            KeyMode::Keyfile => write!(f, "keyfile"),
        }
    }
}

/// Resolves the key file path for a repository in keyfile mode
pub fn keyfile_path(engine: &EngineConfig, config: &RepoConfig) -> PathBuf {
    engine
        .key_file
        .clone()
        .unwrap_or_else(|| engine.keys_dir.join(config.id.to_string()))
}

/// Generates key material for a new repository and stores it according to
/// the chosen mode.
///
/// In repokey mode the wrapped key lands in `config` (the caller persists
/// it); in keyfile mode it is written to the key directory immediately.
pub fn create_key(
    mode: KeyMode,
    config: &mut RepoConfig,
    engine: &EngineConfig,
    encryption: Encryption,
    passphrase: &[u8],
) -> Result<Key> {
    // Wrapping always encrypts, even when the repository's own objects do
    // not; pick a real cipher with a fresh nonce for the wrap
    let encryption = match encryption {
        Encryption::NoEncryption => Encryption::new_chacha20(),
        Encryption::AES256CTR { .. } => Encryption::new_aes256ctr(),
        Encryption::ChaCha20 { .. } => Encryption::new_chacha20(),
    };
    match mode {
        KeyMode::None => Ok(Key::blank()),
        KeyMode::Repokey => {
            let key = Key::random(32);
            config.key = Some(EncryptedKey::encrypt_defaults(&key, encryption, passphrase));
            info!("Generated repokey key material for {}", config.id);
            Ok(key)
        }
        KeyMode::Keyfile => {
            let key = Key::random(32);
            let wrapped = EncryptedKey::encrypt_defaults(&key, encryption, passphrase);
            let path = keyfile_path(engine, config);
            write_keyfile(&path, &wrapped)?;
            info!("Wrote key file {:?} for {}", path, config.id);
            Ok(key)
        }
    }
}

/// Determines the key mode of an existing repository and unwraps its key.
///
/// `passphrase` is only consulted for encrypted modes; `None` means no
/// passphrase source was available, which surfaces as
/// `PassphraseRequired` so the caller can prompt and retry.
pub fn load_key(
    config: &RepoConfig,
    engine: &EngineConfig,
    passphrase: Option<&[u8]>,
) -> Result<(KeyMode, Key)> {
    if let Some(wrapped) = &config.key {
        let passphrase = passphrase.ok_or(KeyManagerError::PassphraseRequired)?;
        let key = wrapped.decrypt(passphrase)?;
        debug!("Unlocked repokey key material");
        return Ok((KeyMode::Repokey, key));
    }
    let path = keyfile_path(engine, config);
    if path.exists() {
        let passphrase = passphrase.ok_or(KeyManagerError::PassphraseRequired)?;
        let wrapped: EncryptedKey = rmp_serde::decode::from_read(File::open(&path)?)?;
        let key = wrapped.decrypt(passphrase)?;
        debug!("Unlocked keyfile key material from {:?}", path);
        return Ok((KeyMode::Keyfile, key));
    }
    Ok((KeyMode::None, Key::blank()))
}

/// Re-wraps the key under a new passphrase, in place for whichever mode the
/// repository uses
pub fn change_passphrase(
    mode: KeyMode,
    key: &Key,
    config: &mut RepoConfig,
    engine: &EngineConfig,
    encryption: Encryption,
    new_passphrase: &[u8],
) -> Result<()> {
    let encryption = match encryption {
        Encryption::NoEncryption => Encryption::new_chacha20(),
        Encryption::AES256CTR { .. } => Encryption::new_aes256ctr(),
        Encryption::ChaCha20 { .. } => Encryption::new_chacha20(),
    };
    match mode {
        KeyMode::None => Ok(()),
        KeyMode::Repokey => {
            config.key = Some(EncryptedKey::encrypt_defaults(key, encryption, new_passphrase));
            Ok(())
        }
        KeyMode::Keyfile => {
            let wrapped = EncryptedKey::encrypt_defaults(key, encryption, new_passphrase);
            write_keyfile(&keyfile_path(engine, config), &wrapped)
        }
    }
}

fn write_keyfile(path: &Path, wrapped: &EncryptedKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    rmp_serde::encode::write(&mut file, wrapped).expect("Unable to serialize key file");
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::repository::ChunkSettings;
    use tempfile::tempdir;

    #[test]
    fn repokey_round_trip() {
        let dir = tempdir().unwrap();
        let engine = EngineConfig::isolated(dir.path());
        let mut config = RepoConfig::new(ChunkSettings::lightweight(), true);
        let key = create_key(
            KeyMode::Repokey,
            &mut config,
            &engine,
            Encryption::new_chacha20(),
            b"pw",
        )
        .unwrap();
        assert!(config.key.is_some());

        let (mode, loaded) = load_key(&config, &engine, Some(b"pw")).unwrap();
        assert_eq!(mode, KeyMode::Repokey);
        assert_eq!(loaded, key);
    }

    #[test]
    fn keyfile_round_trip() {
        let dir = tempdir().unwrap();
        let engine = EngineConfig::isolated(dir.path());
        let mut config = RepoConfig::new(ChunkSettings::lightweight(), true);
        let key = create_key(
            KeyMode::Keyfile,
            &mut config,
            &engine,
            Encryption::new_chacha20(),
            b"pw",
        )
        .unwrap();
        // Nothing sensitive lands in the repository config
        assert!(config.key.is_none());
        assert!(keyfile_path(&engine, &config).exists());

        let (mode, loaded) = load_key(&config, &engine, Some(b"pw")).unwrap();
        assert_eq!(mode, KeyMode::Keyfile);
        assert_eq!(loaded, key);
    }

    #[test]
    fn missing_passphrase_is_reported() {
        let dir = tempdir().unwrap();
        let engine = EngineConfig::isolated(dir.path());
        let mut config = RepoConfig::new(ChunkSettings::lightweight(), true);
        create_key(
            KeyMode::Repokey,
            &mut config,
            &engine,
            Encryption::new_chacha20(),
            b"pw",
        )
        .unwrap();
        assert!(matches!(
            load_key(&config, &engine, None),
            Err(KeyManagerError::PassphraseRequired)
        ));
    }

    #[test]
    fn unencrypted_repository_gets_blank_key() {
        let dir = tempdir().unwrap();
        let engine = EngineConfig::isolated(dir.path());
        let config = RepoConfig::new(ChunkSettings::lightweight(), false);
        let (mode, key) = load_key(&config, &engine, None).unwrap();
        assert_eq!(mode, KeyMode::None);
        assert_eq!(key, Key::blank());
    }

    #[test]
    fn change_passphrase_rewraps() {
        let dir = tempdir().unwrap();
        let engine = EngineConfig::isolated(dir.path());
        let mut config = RepoConfig::new(ChunkSettings::lightweight(), true);
        let key = create_key(
            KeyMode::Repokey,
            &mut config,
            &engine,
            Encryption::new_chacha20(),
            b"old",
        )
        .unwrap();
        change_passphrase(
            KeyMode::Repokey,
            &key,
            &mut config,
            &engine,
            Encryption::new_chacha20(),
            b"new",
        )
        .unwrap();
        assert!(load_key(&config, &engine, Some(b"old")).is_err());
        let (_, reloaded) = load_key(&config, &engine, Some(b"new")).unwrap();
        assert_eq!(reloaded, key);
    }
}
