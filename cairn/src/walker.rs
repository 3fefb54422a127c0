/*!
Recursive filesystem enumeration for archive creation.

The walker yields entries in a deterministic (name-sorted) order and
consults an external predicate for include/exclude decisions; a directory
the predicate rejects is skipped wholesale, subtree included. Pattern
syntax and matching are explicitly someone else's problem.
*/
use tracing::warn;
use walkdir::WalkDir;

use std::path::{Component, Path, PathBuf};

/// One filesystem object the walker produced
#[derive(Debug)]
pub struct WalkEntry {
    /// The real path on disk
    pub path: PathBuf,
    /// The normalised path as it will be stored
    pub stored_path: String,
    /// Symlink metadata (links are recorded, never followed)
    pub metadata: std::fs::Metadata,
}

/// Normalises a path for storage: relative, forward-slash separated, no
/// leading separator, and no current/parent-directory components
pub fn normalize_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                // Stored paths never climb; drop the component
            }
        }
    }
    parts.join("/")
}

/// Walks `root` depth-first in name order, yielding every object the
/// matcher accepts.
///
/// Unreadable entries are logged and skipped rather than aborting the
/// walk; the caller counts them as warnings.
pub fn walk<'a, F>(root: &'a Path, matcher: F) -> impl Iterator<Item = WalkEntry> + 'a
where
    F: Fn(&Path) -> bool + 'a,
{
    WalkDir::new(root)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(move |entry| matcher(entry.path()))
        .filter_map(|entry| match entry {
            Ok(entry) => match entry.metadata() {
                Ok(metadata) => Some(WalkEntry {
                    stored_path: normalize_path(entry.path()),
                    path: entry.path().to_path_buf(),
                    metadata,
                }),
                Err(err) => {
                    warn!("Skipping {:?}: {}", entry.path(), err);
                    None
                }
            },
            Err(err) => {
                warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
}
