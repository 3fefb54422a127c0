/*!
On-disk repository locking.

One exclusive lock holder mutates a repository at a time; any number of
shared holders may read concurrently. The exclusive lock is a directory
(`lock.exclusive`) created atomically, holding an owner record; shared
holders register in a roster file (`lock.roster`).

Owner records carry the holder's host id, process id, and acquisition
time, so other holders can diagnose contention. A lock whose owner ran on
this host and whose process is demonstrably gone is considered stale and
is broken automatically; locks from other hosts are never broken without
an explicit request.
*/
use crate::repository::files::LockedFile;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use std::fs::{create_dir, remove_dir, remove_file, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const EXCLUSIVE_DIR: &str = "lock.exclusive";
const ROSTER_FILE: &str = "lock.roster";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("I/O error while handling repository lock")]
    IOError(#[from] std::io::Error),
    #[error("Lock roster is corrupt")]
    RosterCorrupt(#[from] rmp_serde::decode::Error),
    #[error("Repository is locked by {holder}")]
    Held { holder: String },
    #[error("Repository lock looks stale but belongs to another host ({holder}); refusing to break it")]
    StaleForeign { holder: String },
}

type Result<T> = std::result::Result<T, LockError>;

/// Identity of a lock holder, written into the lock itself for diagnostics
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    pub host_id: String,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

impl LockOwner {
    fn ours(host_id: &str) -> LockOwner {
        LockOwner {
            host_id: host_id.to_string(),
            pid: std::process::id(),
            timestamp: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} pid {} since {}",
            self.host_id, self.pid, self.timestamp
        )
    }

    /// Whether this owner is demonstrably gone: same host, and its process
    /// no longer exists. Owners on other hosts are never "demonstrably"
    /// anything from here.
    fn is_stale(&self, host_id: &str) -> bool {
        self.host_id == host_id && !process_alive(self.pid)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 performs error checking only. EPERM still means the process
    // exists.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a way to probe, treat every owner as alive; breaking then
    // requires an explicit request
    true
}

/// The exclusive write lock on a repository.
///
/// Released on drop.
#[derive(Debug)]
pub struct ExclusiveLock {
    dir: PathBuf,
}

impl ExclusiveLock {
    /// Acquires the exclusive lock.
    ///
    /// Fails if another holder (exclusive or shared) is present, unless the
    /// other holder ran on this host and its process is gone, in which case
    /// the stale lock is broken and acquisition retried once.
    pub fn acquire(repository: &Path, host_id: &str) -> Result<ExclusiveLock> {
        match Self::try_acquire(repository, host_id) {
            Err(LockError::Held { holder }) => {
                if Self::break_if_stale(repository, host_id)? {
                    warn!("Broke stale exclusive lock ({})", holder);
                    Self::try_acquire(repository, host_id)
                } else {
                    Err(LockError::Held { holder })
                }
            }
            other => other,
        }
    }

    fn try_acquire(repository: &Path, host_id: &str) -> Result<ExclusiveLock> {
        // Readers exclude writers
        let readers = Roster::read(repository)?;
        if let Some(owner) = readers.holders.iter().find(|o| !o.is_stale(host_id)) {
            return Err(LockError::Held {
                holder: owner.describe(),
            });
        }
        let dir = repository.join(EXCLUSIVE_DIR);
        match create_dir(&dir) {
            Ok(()) => {
                let owner = LockOwner::ours(host_id);
                let mut file = File::create(dir.join("owner"))?;
                rmp_serde::encode::write(&mut file, &owner)
                    .expect("Unable to serialize lock owner");
                file.sync_all()?;
                debug!("Acquired exclusive lock on {:?}", repository);
                Ok(ExclusiveLock { dir })
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::current_owner(repository)?
                    .map_or_else(|| "unknown holder".to_string(), |o| o.describe());
                Err(LockError::Held { holder })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the owner record of the current exclusive lock, if any
    pub fn current_owner(repository: &Path) -> Result<Option<LockOwner>> {
        let owner_path = repository.join(EXCLUSIVE_DIR).join("owner");
        if !owner_path.exists() {
            return Ok(None);
        }
        let file = File::open(owner_path)?;
        Ok(Some(rmp_serde::decode::from_read(file)?))
    }

    /// Breaks the exclusive lock if its holder is demonstrably gone.
    ///
    /// Returns whether a lock was broken. A live-looking lock from another
    /// host is reported via `StaleForeign` when `force` breaking is needed;
    /// use [`ExclusiveLock::force_break`] after operator confirmation.
    fn break_if_stale(repository: &Path, host_id: &str) -> Result<bool> {
        match Self::current_owner(repository)? {
            Some(owner) if owner.is_stale(host_id) => {
                Self::force_break(repository)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Unconditionally removes the exclusive lock. Only for operator use.
    pub fn force_break(repository: &Path) -> Result<()> {
        let dir = repository.join(EXCLUSIVE_DIR);
        let owner = dir.join("owner");
        if owner.exists() {
            remove_file(owner)?;
        }
        if dir.exists() {
            remove_dir(dir)?;
        }
        Ok(())
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = remove_file(self.dir.join("owner"));
        let _ = remove_dir(&self.dir);
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Roster {
    holders: Vec<LockOwner>,
}

impl Roster {
    fn read(repository: &Path) -> Result<Roster> {
        let path = repository.join(ROSTER_FILE);
        if !path.exists() {
            return Ok(Roster::default());
        }
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Roster::default());
        }
        Ok(rmp_serde::decode::from_read(file)?)
    }

    /// Applies `edit` to the roster under the roster's own file lock
    fn update(repository: &Path, edit: impl FnOnce(&mut Roster)) -> Result<()> {
        let path = repository.join(ROSTER_FILE);
        let mut file = loop {
            if let Some(file) = LockedFile::open_read_write(&path)? {
                break file;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        let mut roster = if file.metadata()?.len() == 0 {
            Roster::default()
        } else {
            rmp_serde::decode::from_read(&mut *file)?
        };
        edit(&mut roster);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        rmp_serde::encode::write(&mut *file, &roster).expect("Unable to serialize lock roster");
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// A shared (reader) lock on a repository.
///
/// Released on drop. Multiple shared locks coexist; an exclusive lock
/// excludes them all.
#[derive(Debug)]
pub struct SharedLock {
    repository: PathBuf,
    owner: LockOwner,
}

impl SharedLock {
    pub fn acquire(repository: &Path, host_id: &str) -> Result<SharedLock> {
        // A writer excludes readers
        if let Some(owner) = ExclusiveLock::current_owner(repository)? {
            if owner.is_stale(host_id) {
                warn!("Ignoring stale exclusive lock ({})", owner.describe());
                ExclusiveLock::force_break(repository)?;
            } else {
                return Err(LockError::Held {
                    holder: owner.describe(),
                });
            }
        }
        let owner = LockOwner::ours(host_id);
        let registered = owner.clone();
        Roster::update(repository, move |roster| {
            // Drop dead holders from this host while we are here
            roster
                .holders
                .retain(|o| !o.is_stale(&registered.host_id));
            roster.holders.push(registered);
        })?;
        debug!("Acquired shared lock on {:?}", repository);
        Ok(SharedLock {
            repository: repository.to_path_buf(),
            owner,
        })
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        let owner = self.owner.clone();
        let _ = Roster::update(&self.repository, move |roster| {
            roster.holders.retain(|o| *o != owner);
        });
    }
}

/// Builds the host id used in lock owner records: the hostname plus a
/// caller-provided stable node identifier, unless an explicit override is
/// supplied
pub fn host_id(node_id: &str, override_value: Option<&str>) -> String {
    if let Some(value) = override_value {
        return value.to_string();
    }
    let fqdn = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", fqdn, node_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_excludes_exclusive() {
        let dir = tempdir().unwrap();
        let first = ExclusiveLock::acquire(dir.path(), "host@a").unwrap();
        let second = ExclusiveLock::acquire(dir.path(), "host@a");
        assert!(matches!(second, Err(LockError::Held { .. })));
        drop(first);
        let third = ExclusiveLock::acquire(dir.path(), "host@a");
        assert!(third.is_ok());
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let a = SharedLock::acquire(dir.path(), "host@a").unwrap();
        let b = SharedLock::acquire(dir.path(), "host@a").unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn readers_exclude_writer() {
        let dir = tempdir().unwrap();
        let reader = SharedLock::acquire(dir.path(), "host@a").unwrap();
        let writer = ExclusiveLock::acquire(dir.path(), "host@a");
        assert!(matches!(writer, Err(LockError::Held { .. })));
        drop(reader);
        assert!(ExclusiveLock::acquire(dir.path(), "host@a").is_ok());
    }

    #[test]
    fn writer_excludes_readers() {
        let dir = tempdir().unwrap();
        let writer = ExclusiveLock::acquire(dir.path(), "host@a").unwrap();
        let reader = SharedLock::acquire(dir.path(), "host@a");
        assert!(matches!(reader, Err(LockError::Held { .. })));
        drop(writer);
    }

    #[test]
    fn stale_lock_from_dead_process_is_broken() {
        let dir = tempdir().unwrap();
        // Fabricate a lock owned by a process id that cannot exist
        create_dir(dir.path().join(EXCLUSIVE_DIR)).unwrap();
        let owner = LockOwner {
            host_id: "host@a".to_string(),
            pid: 999_999_999,
            timestamp: Utc::now(),
        };
        let mut file = File::create(dir.path().join(EXCLUSIVE_DIR).join("owner")).unwrap();
        rmp_serde::encode::write(&mut file, &owner).unwrap();
        drop(file);

        let lock = ExclusiveLock::acquire(dir.path(), "host@a");
        assert!(lock.is_ok());
    }

    #[test]
    fn foreign_lock_is_not_broken() {
        let dir = tempdir().unwrap();
        create_dir(dir.path().join(EXCLUSIVE_DIR)).unwrap();
        let owner = LockOwner {
            host_id: "elsewhere@b".to_string(),
            pid: 999_999_999,
            timestamp: Utc::now(),
        };
        let mut file = File::create(dir.path().join(EXCLUSIVE_DIR).join("owner")).unwrap();
        rmp_serde::encode::write(&mut file, &owner).unwrap();
        drop(file);

        let lock = ExclusiveLock::acquire(dir.path(), "host@a");
        assert!(matches!(lock, Err(LockError::Held { .. })));
    }

    #[test]
    fn host_id_override_wins() {
        assert_eq!(host_id("node", Some("forced")), "forced");
        assert!(host_id("node", None).ends_with("@node"));
    }
}
