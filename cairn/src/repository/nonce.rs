/*!
The persistent nonce counter.

Encryption nonces are drawn from a strictly monotonic counter kept in the
client's security directory, one counter per repository id. A block of
nonces is reserved by persisting the advanced counter (fsync, then rename)
*before* any ciphertext using those nonces can become durable, so a crash
can skip nonces but never reuse one.

On open the counter is reconciled against the maximum nonce observed in
the repository. A counter file that has gone *backwards* relative to the
repository means the security directory was restored from a backup or
tampered with; that is a fatal security error, never silently repaired.
*/
use byteorder::{ByteOrder, LE};
use thiserror::Error;
use tracing::{debug, warn};

use std::fs::{create_dir_all, rename, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

#[derive(Error, Debug)]
pub enum NonceError {
    #[error("I/O error on nonce counter file")]
    IOError(#[from] std::io::Error),
    #[error("Nonce counter file is corrupt")]
    Corrupt,
    #[error(
        "Nonce counter regression: repository has seen nonce {observed} but the counter file \
         holds {stored}. The security directory may have been restored from a backup; refusing \
         to continue"
    )]
    Regression { stored: u64, observed: u64 },
    #[error("Nonce space exhausted")]
    Exhausted,
}

type Result<T> = std::result::Result<T, NonceError>;

/// Handle to one repository's persistent nonce counter.
///
/// Must only be constructed while holding the repository's exclusive lock;
/// the counter is advanced before any ciphertext using the reserved nonces
/// is written.
#[derive(Debug)]
pub struct NonceStore {
    path: PathBuf,
    /// The next nonce that has never been handed out
    next: u64,
}

impl NonceStore {
    /// Opens (creating if necessary) the counter for the given repository
    /// id inside the security directory
    pub fn open(security_dir: &Path, repository_id: &str) -> Result<NonceStore> {
        let dir = security_dir.join(repository_id);
        create_dir_all(&dir)?;
        let path = dir.join("nonce");
        let next = if path.exists() {
            let mut buffer = Vec::new();
            File::open(&path)?.read_to_end(&mut buffer)?;
            if buffer.len() != 8 {
                return Err(NonceError::Corrupt);
            }
            LE::read_u64(&buffer)
        } else {
            0
        };
        debug!("Opened nonce store at {:?}, next nonce {}", path, next);
        Ok(NonceStore { path, next })
    }

    /// Reconciles the counter with the highest nonce observed in the
    /// repository.
    ///
    /// A fresh counter (zero) silently advances past the observed maximum,
    /// which is the normal situation for a client touching an existing
    /// repository for the first time. A non-fresh counter at or below the
    /// observed maximum is a regression and is fatal.
    pub fn reconcile(&mut self, observed_max: Option<u64>) -> Result<()> {
        let observed = match observed_max {
            Some(observed) => observed,
            None => return Ok(()),
        };
        if self.next > observed {
            return Ok(());
        }
        if self.next == 0 {
            warn!(
                "Nonce counter is fresh; advancing past repository maximum {}",
                observed
            );
            self.persist(observed + 1)?;
            return Ok(());
        }
        Err(NonceError::Regression {
            stored: self.next,
            observed,
        })
    }

    /// Reserves `count` consecutive nonces, returning the first.
    ///
    /// The advanced counter hits the disk before this returns.
    pub fn reserve(&mut self, count: u64) -> Result<u64> {
        let start = self.next;
        let end = start.checked_add(count).ok_or(NonceError::Exhausted)?;
        self.persist(end)?;
        Ok(start)
    }

    /// The next nonce that would be handed out
    pub fn peek(&self) -> u64 {
        self.next
    }

    fn persist(&mut self, value: u64) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            let mut buffer = [0_u8; 8];
            LE::write_u64(&mut buffer, value);
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        rename(&tmp, &self.path)?;
        self.next = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reservations_are_monotonic_and_durable() {
        let dir = tempdir().unwrap();
        let mut store = NonceStore::open(dir.path(), "repo").unwrap();
        let first = store.reserve(10).unwrap();
        let second = store.reserve(5).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 10);

        // A reopened store continues where the last reservation ended
        let reopened = NonceStore::open(dir.path(), "repo").unwrap();
        assert_eq!(reopened.peek(), 15);
    }

    #[test]
    fn fresh_counter_advances_past_repository() {
        let dir = tempdir().unwrap();
        let mut store = NonceStore::open(dir.path(), "repo").unwrap();
        store.reconcile(Some(100)).unwrap();
        assert_eq!(store.peek(), 101);
    }

    #[test]
    fn regression_is_fatal() {
        let dir = tempdir().unwrap();
        let mut store = NonceStore::open(dir.path(), "repo").unwrap();
        store.reserve(5).unwrap();
        let result = store.reconcile(Some(50));
        assert!(matches!(result, Err(NonceError::Regression { .. })));
    }

    #[test]
    fn counters_are_per_repository() {
        let dir = tempdir().unwrap();
        let mut a = NonceStore::open(dir.path(), "repo-a").unwrap();
        a.reserve(7).unwrap();
        let b = NonceStore::open(dir.path(), "repo-b").unwrap();
        assert_eq!(b.peek(), 0);
    }
}
