/*!
Client-side caches: the chunks index and the files index.

Both caches are derivable from the repository (plus the key) and exist
purely to make backups fast: the chunks index answers "does this chunk
already exist, and how often is it referenced" without a round trip, and
the files index skips re-reading files that have not changed since the
last backup.

Caches live under the cache base directory in one subdirectory per
repository id.
*/
use crate::config::EngineConfig;

use thiserror::Error;
use uuid::Uuid;

use std::path::PathBuf;

pub mod chunks;
pub mod files;

pub use chunks::{ChunkIndex, ChunkIndexEntry};
pub use files::{FilesIndex, FilesIndexEntry};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error on cache file")]
    IOError(#[from] std::io::Error),
    #[error("Cache file failed to serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Cache file is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Repository error during cache resync")]
    Repository(#[from] crate::repository::RepositoryError),
    #[error("Archive error during cache resync")]
    Archive(Box<crate::archive::ArchiveError>),
}

impl From<crate::archive::ArchiveError> for CacheError {
    fn from(err: crate::archive::ArchiveError) -> CacheError {
        CacheError::Archive(Box::new(err))
    }
}

/// The cache directory for one repository
pub fn cache_dir_for(engine: &EngineConfig, repository_id: Uuid) -> PathBuf {
    engine.cache_dir.join(repository_id.to_string())
}
