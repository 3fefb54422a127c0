use std::fs::{remove_file, File, OpenOptions};
use std::io::{Read, Result, Seek, Write};
use std::ops::{Deref, DerefMut, Drop};
use std::path::{Path, PathBuf};

/// Wraps a file with its paired lock file.
///
/// The lock file is deleted upon dropping. This is a single-file
/// advisory lock used for the writable segment and the persistent index
/// snapshots; the repository-wide reader/writer lock lives in the `lock`
/// module.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
    lock_file_path: PathBuf,
}

impl LockedFile {
    /// Attempts to open a read/write view of the specified file.
    ///
    /// Returns `Ok(None)` if there is any existing lock on the file. Will
    /// create the file if it does not exist.
    pub fn open_read_write<T: AsRef<Path>>(path: T) -> Result<Option<LockedFile>> {
        let path = path.as_ref().to_path_buf();
        let lock_file_path = path.with_extension("lock");
        if lock_file_path.exists() {
            // Someone else holds the file
            Ok(None)
        } else {
            // Create the lock file first, then open the real file
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_file_path)?;
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            Ok(Some(LockedFile {
                file,
                path,
                lock_file_path,
            }))
        }
    }

    /// The path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Deref for LockedFile {
    type Target = File;
    fn deref(&self) -> &File {
        &self.file
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // If the lock file is already gone (e.g. it lived in a now dropped
        // tempdir) there is nothing to clean up
        if self.lock_file_path.exists() {
            remove_file(&self.lock_file_path).unwrap_or_else(|_| {
                panic!(
                    "Unable to delete lock file for {:?}, something went wrong",
                    self.path
                )
            });
        }
    }
}

impl Read for LockedFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LockedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LockedFile {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("somefile");
        let first = LockedFile::open_read_write(&path).unwrap();
        assert!(first.is_some());
        let second = LockedFile::open_read_write(&path).unwrap();
        assert!(second.is_none());
        drop(first);
        let third = LockedFile::open_read_write(&path).unwrap();
        assert!(third.is_some());
    }
}
