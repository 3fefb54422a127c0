/*!
Client-side security state for known repositories.

The security directory remembers, per repository id, where the repository
lived and how it was keyed. A repository that silently moved, or an
unencrypted repository this client has never seen before, is a classic
substitution attack vector; both are fatal unless explicitly acknowledged
through the corresponding environment flag.
*/
use crate::repository::keys::KeyMode;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use std::fs::{create_dir_all, rename, File};
use std::path::{Path, PathBuf};

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("I/O error on security state")]
    IOError(#[from] std::io::Error),
    #[error("Security state is corrupt")]
    DecodeError(#[from] rmp_serde::decode::Error),
    #[error(
        "Repository moved: previously at {previous}, now at {current}. If this relocation is \
         expected, set CAIRN_RELOCATED_REPO_ACCESS_IS_OK=yes"
    )]
    Relocated { previous: String, current: String },
    #[error(
        "Accessing an unencrypted repository this client has not seen before. If this is \
         intentional, set CAIRN_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK=yes"
    )]
    UnknownUnencrypted,
    #[error("Repository key mode changed from {previous} to {current}; refusing a silent downgrade")]
    KeyModeChanged { previous: String, current: String },
}

type Result<T> = std::result::Result<T, SecurityError>;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SecurityState {
    location: String,
    key_mode: String,
}

/// Per-repository security state kept in the client's security directory
#[derive(Debug)]
pub struct SecurityCache {
    dir: PathBuf,
}

impl SecurityCache {
    pub fn open(security_dir: &Path, repository_id: &str) -> Result<SecurityCache> {
        let dir = security_dir.join(repository_id);
        create_dir_all(&dir)?;
        Ok(SecurityCache { dir })
    }

    /// Validates the repository's location and key mode against what this
    /// client has seen before, updating the stored state on success.
    ///
    /// `allow_relocated` and `allow_unencrypted` are the explicit
    /// acknowledgement flags from the engine configuration.
    pub fn check_and_update(
        &self,
        location: &str,
        key_mode: KeyMode,
        allow_relocated: bool,
        allow_unencrypted: bool,
    ) -> Result<()> {
        let state_path = self.dir.join("state");
        let previous: Option<SecurityState> = if state_path.exists() {
            Some(rmp_serde::decode::from_read(File::open(&state_path)?)?)
        } else {
            None
        };

        match &previous {
            Some(previous) => {
                if previous.location != location {
                    if allow_relocated {
                        warn!(
                            "Repository relocation {} -> {} acknowledged",
                            previous.location, location
                        );
                    } else {
                        return Err(SecurityError::Relocated {
                            previous: previous.location.clone(),
                            current: location.to_string(),
                        });
                    }
                }
                let current_mode = key_mode.to_string();
                if previous.key_mode != current_mode {
                    // A mode change away from encryption is a downgrade and
                    // never acknowledged implicitly
                    return Err(SecurityError::KeyModeChanged {
                        previous: previous.key_mode.clone(),
                        current: current_mode,
                    });
                }
            }
            None => {
                if key_mode == KeyMode::None && !allow_unencrypted {
                    return Err(SecurityError::UnknownUnencrypted);
                }
            }
        }

        let state = SecurityState {
            location: location.to_string(),
            key_mode: key_mode.to_string(),
        };
        let tmp = self.dir.join("state.tmp");
        {
            let mut file = File::create(&tmp)?;
            rmp_serde::encode::write(&mut file, &state)
                .expect("Unable to serialize security state");
            file.sync_all()?;
        }
        rename(tmp, state_path)?;
        debug!("Security state updated for {:?}", self.dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_contact_with_encrypted_repo_is_fine() {
        let dir = tempdir().unwrap();
        let cache = SecurityCache::open(dir.path(), "repo").unwrap();
        cache
            .check_and_update("/r", KeyMode::Repokey, false, false)
            .unwrap();
        // Same location again is fine
        cache
            .check_and_update("/r", KeyMode::Repokey, false, false)
            .unwrap();
    }

    #[test]
    fn unknown_unencrypted_needs_acknowledgement() {
        let dir = tempdir().unwrap();
        let cache = SecurityCache::open(dir.path(), "repo").unwrap();
        assert!(matches!(
            cache.check_and_update("/r", KeyMode::None, false, false),
            Err(SecurityError::UnknownUnencrypted)
        ));
        cache
            .check_and_update("/r", KeyMode::None, false, true)
            .unwrap();
        // Once known, no further acknowledgement needed
        cache
            .check_and_update("/r", KeyMode::None, false, false)
            .unwrap();
    }

    #[test]
    fn relocation_is_detected() {
        let dir = tempdir().unwrap();
        let cache = SecurityCache::open(dir.path(), "repo").unwrap();
        cache
            .check_and_update("/old", KeyMode::Keyfile, false, false)
            .unwrap();
        assert!(matches!(
            cache.check_and_update("/new", KeyMode::Keyfile, false, false),
            Err(SecurityError::Relocated { .. })
        ));
        cache
            .check_and_update("/new", KeyMode::Keyfile, true, false)
            .unwrap();
    }

    #[test]
    fn downgrade_to_unencrypted_is_fatal() {
        let dir = tempdir().unwrap();
        let cache = SecurityCache::open(dir.path(), "repo").unwrap();
        cache
            .check_and_update("/r", KeyMode::Repokey, false, false)
            .unwrap();
        assert!(matches!(
            cache.check_and_update("/r", KeyMode::None, false, true),
            Err(SecurityError::KeyModeChanged { .. })
        ));
    }
}
