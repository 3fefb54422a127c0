/*!
The repository's own on-disk configuration.

A repository directory carries a human-readable `README` and a `config`
record holding the repository id, format version, segment sizing, and, in
repokey mode, the passphrase-wrapped key material. Opening a repository
whose config names an unknown format version is a fatal error; format
changes require an explicit upgrade step.
*/
use cairn_core::repository::{ChunkSettings, EncryptedKey};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::fs::{rename, File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// The repository format version this build reads and writes
pub const REPOSITORY_VERSION: u32 = 1;

/// Default cap on one segment file. Large-file filesystems tolerate up to
/// ~2 GiB, but smaller segments keep compaction and recovery granular.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 500 * 1024 * 1024;

/// Default directory fan-out for `data/`
pub const DEFAULT_SEGMENTS_PER_DIRECTORY: u64 = 1000;

/// Default free-space share at which a segment becomes a compaction
/// candidate
pub const DEFAULT_COMPACTION_THRESHOLD_PERCENT: u64 = 25;

const README_TEXT: &str = "This is a cairn backup repository.\n\
     See https://gitlab.com/cairn-rs/cairn/ for details.\n";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error on repository config")]
    IOError(#[from] std::io::Error),
    #[error("Repository config failed to serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Repository config is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Repository has format version {0}, this build supports {}; run upgrade first", REPOSITORY_VERSION)]
    UnknownVersion(u32),
    #[error("Path does not look like a cairn repository (no config file)")]
    NotARepository,
}

type Result<T> = std::result::Result<T, ConfigError>;

/// The persistent `config` record at the repository root
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RepoConfig {
    pub version: u32,
    pub id: Uuid,
    pub segments_per_directory: u64,
    pub max_segment_size: u64,
    pub compaction_threshold_percent: u64,
    /// Whether manifests without a valid authentication tag are refused
    pub tam_required: bool,
    /// Default compression/encryption/keyed-hash selections for new objects.
    ///
    /// The encryption value is an algorithm template; per-object nonces are
    /// substituted at pack time.
    pub settings: ChunkSettings,
    /// Wrapped key material, present in repokey mode only
    pub key: Option<EncryptedKey>,
}

impl RepoConfig {
    /// Fresh configuration for a new repository with default sizing
    pub fn new(settings: ChunkSettings, tam_required: bool) -> RepoConfig {
        RepoConfig {
            version: REPOSITORY_VERSION,
            id: Uuid::new_v4(),
            segments_per_directory: DEFAULT_SEGMENTS_PER_DIRECTORY,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            compaction_threshold_percent: DEFAULT_COMPACTION_THRESHOLD_PERCENT,
            tam_required,
            settings,
            key: None,
        }
    }

    /// Loads the config of an existing repository.
    ///
    /// # Errors
    ///
    /// `NotARepository` when the config file is missing entirely, and
    /// `UnknownVersion` when the format version is not supported by this
    /// build.
    pub fn load(repository: &Path) -> Result<RepoConfig> {
        let path = repository.join("config");
        if !path.exists() {
            return Err(ConfigError::NotARepository);
        }
        let config: RepoConfig = rmp_serde::decode::from_read(File::open(path)?)?;
        if config.version != REPOSITORY_VERSION {
            return Err(ConfigError::UnknownVersion(config.version));
        }
        Ok(config)
    }

    /// Persists the config atomically via rename
    pub fn save(&self, repository: &Path) -> Result<()> {
        let tmp = repository.join("config.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            rmp_serde::encode::write(&mut file, self)?;
            file.flush()?;
            file.sync_all()?;
        }
        rename(tmp, repository.join("config"))?;
        Ok(())
    }

    /// Writes the repository README; called once at initialization
    pub fn write_readme(repository: &Path) -> Result<()> {
        let mut file = File::create(repository.join("README"))?;
        file.write_all(README_TEXT.as_bytes())?;
        Ok(())
    }
}
