/*!
The manifest: the root object of the repository's object graph.

The manifest lives at the fixed all-zero id and maps archive names to
archive metadata objects, along with the repository's chunker parameters
and compression hint. It is updated read-modify-write under the exclusive
lock; the manifest swap is the linearisation point of every commit.

# Authentication

The manifest carries a TAM (tertiary authentication message): a keyed MAC
over its canonical serialisation, using a subkey derived from the MAC key.
Since archives are only reachable through the manifest, authenticating the
manifest authenticates the set of archives; without it, an attacker able
to write the repository could roll individual archives back undetected.
Clients refuse manifests lacking or failing the TAM when the repository
requires it, and a one-shot upgrade attaches a TAM to a manifest from
before the requirement was enabled.
*/
use crate::repository::{Repository, RepositoryError};
use cairn_core::archive::ChunkerParams;
use cairn_core::repository::{ChunkId, Compression, ObjectKind, HMAC};

use chrono::prelude::*;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use std::collections::BTreeMap;

/// Current manifest format version
const MANIFEST_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Repository error")]
    Repository(#[from] RepositoryError),
    #[error("Repository has no manifest")]
    NoManifest,
    #[error("Object at the manifest id is not a manifest")]
    NotAManifest,
    #[error("Manifest failed to parse")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error("Manifest failed to serialize")]
    EncodeError(#[from] rmp_serde::encode::Error),
    #[error("Manifest carries no authentication tag, but this repository requires one")]
    TamMissing,
    #[error("Manifest authentication tag is invalid; the manifest may have been tampered with")]
    TamInvalid,
    #[error("Archive {0} already exists")]
    ArchiveExists(String),
    #[error("Archive {0} does not exist")]
    ArchiveMissing(String),
}

type Result<T> = std::result::Result<T, ManifestError>;

/// A pointer from an archive name to its metadata object
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchivePointer {
    pub id: ChunkId,
    pub time: DateTime<FixedOffset>,
}

/// Server-side defaults carried in the manifest
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ManifestConfig {
    pub chunker: ChunkerParams,
    pub compression: Compression,
}

impl Default for ManifestConfig {
    fn default() -> ManifestConfig {
        ManifestConfig {
            chunker: ChunkerParams::default(),
            compression: Compression::default(),
        }
    }
}

/// A named archive as the manifest lists it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveListEntry {
    pub name: String,
    pub id: ChunkId,
    pub time: DateTime<FixedOffset>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Manifest {
    version: u32,
    /// Bumped on every store; strictly monotonic to prevent replay
    timestamp: DateTime<Utc>,
    archives: BTreeMap<String, ArchivePointer>,
    pub config: ManifestConfig,
    tam: Option<Vec<u8>>,
}

impl Manifest {
    /// A fresh manifest for a new repository
    pub fn empty(config: ManifestConfig) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            timestamp: Utc::now(),
            archives: BTreeMap::new(),
            config,
            tam: None,
        }
    }

    /// Loads and authenticates the manifest from the repository
    pub fn load(repo: &mut Repository) -> Result<Manifest> {
        let manifest = Manifest::load_unchecked(repo)?;
        match &manifest.tam {
            Some(tam) => {
                let expected = manifest.compute_tam(repo);
                if !constant_time_eq(tam, &expected) {
                    return Err(ManifestError::TamInvalid);
                }
            }
            None => {
                if repo.config.tam_required {
                    return Err(ManifestError::TamMissing);
                }
            }
        }
        debug!(
            "Loaded manifest with {} archives (timestamp {})",
            manifest.archives.len(),
            manifest.timestamp
        );
        Ok(manifest)
    }

    /// Loads the manifest without TAM verification.
    ///
    /// Only for the TAM upgrade path; everything else goes through `load`.
    fn load_unchecked(repo: &mut Repository) -> Result<Manifest> {
        let (kind, bytes) = match repo.get_data(ChunkId::manifest_id()) {
            Ok(found) => found,
            Err(RepositoryError::ObjectMissing(_)) => return Err(ManifestError::NoManifest),
            Err(err) => return Err(err.into()),
        };
        if kind != ObjectKind::Manifest {
            return Err(ManifestError::NotAManifest);
        }
        Ok(rmp_serde::decode::from_read(&bytes[..])?)
    }

    /// Writes the manifest back to the repository, attaching a fresh TAM.
    ///
    /// Does not commit; the caller decides the transaction boundary.
    pub fn store(&mut self, repo: &mut Repository) -> Result<()> {
        let now = Utc::now();
        self.timestamp = if now > self.timestamp {
            now
        } else {
            self.timestamp + Duration::microseconds(1)
        };
        self.tam = None;
        self.tam = Some(self.compute_tam(repo));
        let bytes = rmp_serde::to_vec(self)?;
        repo.put_manifest_bytes(&bytes)?;
        debug!("Stored manifest with {} archives", self.archives.len());
        Ok(())
    }

    /// One-shot upgrade: attaches a TAM to an existing manifest without
    /// altering archive contents
    pub fn upgrade_tam(repo: &mut Repository) -> Result<()> {
        let mut manifest = Manifest::load_unchecked(repo)?;
        manifest.store(repo)?;
        repo.commit()?;
        info!("Attached authentication tag to the manifest");
        Ok(())
    }

    /// The canonical bytes the TAM covers: the serialisation with the tam
    /// field blanked
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut blanked = self.clone();
        blanked.tam = None;
        rmp_serde::to_vec(&blanked).expect("Manifest serialization cannot fail")
    }

    fn compute_tam(&self, repo: &Repository) -> Vec<u8> {
        HMAC::Blake2b.mac_with_key(&self.canonical_bytes(), &repo.key().tam_subkey())
    }

    /// A digest identifying this exact manifest state, used by the caches
    /// to detect staleness
    pub fn stamp(&self) -> Vec<u8> {
        HMAC::Blake2b.mac_with_key(&self.canonical_bytes(), b"manifest-stamp")
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Registers an archive under a name that must be free
    pub fn add_archive(
        &mut self,
        name: &str,
        id: ChunkId,
        time: DateTime<FixedOffset>,
    ) -> Result<()> {
        if self.archives.contains_key(name) {
            return Err(ManifestError::ArchiveExists(name.to_string()));
        }
        self.archives
            .insert(name.to_string(), ArchivePointer { id, time });
        Ok(())
    }

    /// Removes an archive by name, returning its pointer
    pub fn remove_archive(&mut self, name: &str) -> Result<ArchivePointer> {
        self.archives
            .remove(name)
            .ok_or_else(|| ManifestError::ArchiveMissing(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&ArchivePointer> {
        self.archives.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.archives.contains_key(name)
    }

    /// Every archive, in name order, checkpoints included
    pub fn archives(&self) -> Vec<ArchiveListEntry> {
        self.archives
            .iter()
            .map(|(name, pointer)| ArchiveListEntry {
                name: name.clone(),
                id: pointer.id,
                time: pointer.time,
            })
            .collect()
    }

    /// Archives for display: checkpoints are hidden unless asked for
    pub fn list(&self, consider_checkpoints: bool) -> Vec<ArchiveListEntry> {
        self.archives()
            .into_iter()
            .filter(|entry| {
                consider_checkpoints
                    || !entry
                        .name
                        .ends_with(cairn_core::archive::record::CHECKPOINT_SUFFIX)
            })
            .collect()
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut difference = 0_u8;
    for (x, y) in a.iter().zip(b.iter()) {
        difference |= x ^ y;
    }
    difference == 0
}
