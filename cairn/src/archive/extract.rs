/*!
Restoring an archive back onto a filesystem.

Items are streamed out of the archive in storage order and recreated one
by one; file content is fetched chunk by chunk, decrypted, decompressed,
and written sequentially. Directory timestamps are fixed up last, since
creating children clobbers them.
*/
use super::{load_archive_by_name, ArchiveError, ItemStreamReader, Result};
use crate::manifest::Manifest;
use crate::repository::Repository;
use cairn_core::archive::{Item, ItemType};
use cairn_core::repository::ObjectKind;

use tracing::{debug, info, instrument, warn};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// What a restore did, and what it could not do
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub items_restored: usize,
    /// Non-fatal problems (unrestorable item kinds, ownership failures,
    /// items previously patched by repair)
    pub warnings: Vec<String>,
}

/// Restores the named archive under `target`.
///
/// `matcher` decides which stored paths to restore; pass `|_| true` for
/// everything.
#[instrument(skip(repo, manifest, matcher))]
pub fn extract<F>(
    repo: &mut Repository,
    manifest: &Manifest,
    name: &str,
    target: &Path,
    matcher: F,
) -> Result<ExtractReport>
where
    F: Fn(&str) -> bool,
{
    let (_, record) = load_archive_by_name(repo, manifest, name)?;
    info!("Extracting archive {} to {:?}", name, target);
    fs::create_dir_all(target)?;

    let mut report = ExtractReport::default();
    // Directory metadata is applied after all children exist
    let mut deferred_dirs: Vec<(PathBuf, Item)> = Vec::new();

    let mut items = ItemStreamReader::new(record.item_stream.clone());
    while let Some(item) = items.next_item(repo)? {
        if !matcher(&item.path) {
            continue;
        }
        if item.path.starts_with('/') || item.path.split('/').any(|part| part == "..") {
            report
                .warnings
                .push(format!("Skipping suspicious stored path {}", item.path));
            continue;
        }
        if item.is_broken() {
            report.warnings.push(format!(
                "{}: was patched by repair, restored content contains zero-filled ranges",
                item.path
            ));
        }
        let dest = target.join(&item.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match &item.item_type {
            ItemType::Directory => {
                if !dest.exists() {
                    fs::create_dir_all(&dest)?;
                }
                deferred_dirs.push((dest, item.clone()));
            }
            ItemType::RegularFile => {
                restore_file_content(repo, &item, &dest)?;
                apply_metadata(&dest, &item, false, &mut report);
            }
            ItemType::Symlink { target: link_target } => {
                restore_symlink(&dest, link_target, &item, &mut report);
            }
            ItemType::Hardlink { source } => {
                let source_path = target.join(source);
                if let Err(err) = fs::hard_link(&source_path, &dest) {
                    report
                        .warnings
                        .push(format!("{}: could not hard link: {}", item.path, err));
                }
            }
            ItemType::CharDevice { major, minor } => {
                restore_device(&dest, &item, *major, *minor, true, &mut report);
            }
            ItemType::BlockDevice { major, minor } => {
                restore_device(&dest, &item, *major, *minor, false, &mut report);
            }
            ItemType::Fifo => {
                restore_fifo(&dest, &item, &mut report);
            }
        }
        report.items_restored += 1;
    }

    // Deepest directories first, so parent timestamps survive
    deferred_dirs.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, item) in deferred_dirs {
        apply_metadata(&path, &item, false, &mut report);
    }
    debug!("Restored {} items", report.items_restored);
    Ok(report)
}

/// Fetches and concatenates a file's chunks in order
fn restore_file_content(repo: &mut Repository, item: &Item, dest: &Path) -> Result<()> {
    let mut file = File::create(dest)?;
    let mut written: u64 = 0;
    for chunk in &item.chunks {
        let (kind, data) = repo.get_data(chunk.id)?;
        if kind != ObjectKind::Data {
            return Err(ArchiveError::WrongObjectKind(chunk.id));
        }
        file.write_all(&data)?;
        written += data.len() as u64;
    }
    if written != item.size {
        warn!(
            "{}: restored {} bytes but item records {}",
            item.path, written, item.size
        );
    }
    Ok(())
}

#[cfg(unix)]
fn restore_symlink(dest: &Path, link_target: &str, item: &Item, report: &mut ExtractReport) {
    if let Err(err) = std::os::unix::fs::symlink(link_target, dest) {
        report
            .warnings
            .push(format!("{}: could not create symlink: {}", item.path, err));
        return;
    }
    apply_metadata(dest, item, true, report);
}

#[cfg(not(unix))]
fn restore_symlink(_dest: &Path, _link_target: &str, item: &Item, report: &mut ExtractReport) {
    report
        .warnings
        .push(format!("{}: symlinks unsupported on this platform", item.path));
}

#[cfg(unix)]
fn restore_device(
    dest: &Path,
    item: &Item,
    major: u32,
    minor: u32,
    character: bool,
    report: &mut ExtractReport,
) {
    use std::os::unix::ffi::OsStrExt;
    let kind = if character { libc::S_IFCHR } else { libc::S_IFBLK };
    let path = match std::ffi::CString::new(dest.as_os_str().as_bytes()) {
        Ok(path) => path,
        Err(_) => {
            report
                .warnings
                .push(format!("{}: path not representable", item.path));
            return;
        }
    };
    let device = libc::makedev(major, minor);
    let result = unsafe { libc::mknod(path.as_ptr(), kind | (item.mode as libc::mode_t), device) };
    if result != 0 {
        report.warnings.push(format!(
            "{}: could not create device node: {}",
            item.path,
            std::io::Error::last_os_error()
        ));
        return;
    }
    apply_metadata(dest, item, false, report);
}

#[cfg(not(unix))]
fn restore_device(
    _dest: &Path,
    item: &Item,
    _major: u32,
    _minor: u32,
    _character: bool,
    report: &mut ExtractReport,
) {
    report
        .warnings
        .push(format!("{}: device nodes unsupported on this platform", item.path));
}

#[cfg(unix)]
fn restore_fifo(dest: &Path, item: &Item, report: &mut ExtractReport) {
    use std::os::unix::ffi::OsStrExt;
    let path = match std::ffi::CString::new(dest.as_os_str().as_bytes()) {
        Ok(path) => path,
        Err(_) => return,
    };
    let result = unsafe { libc::mkfifo(path.as_ptr(), item.mode as libc::mode_t) };
    if result != 0 {
        report.warnings.push(format!(
            "{}: could not create fifo: {}",
            item.path,
            std::io::Error::last_os_error()
        ));
        return;
    }
    apply_metadata(dest, item, false, report);
}

#[cfg(not(unix))]
fn restore_fifo(_dest: &Path, item: &Item, report: &mut ExtractReport) {
    report
        .warnings
        .push(format!("{}: fifos unsupported on this platform", item.path));
}

/// Restores mode, ownership (when privileged), and timestamps
#[cfg(unix)]
fn apply_metadata(dest: &Path, item: &Item, symlink: bool, report: &mut ExtractReport) {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    if !symlink {
        if let Err(err) = fs::set_permissions(dest, fs::Permissions::from_mode(item.mode)) {
            report
                .warnings
                .push(format!("{}: could not set mode: {}", item.path, err));
        }
    }

    // Ownership restoration needs privilege; silently skip otherwise
    if unsafe { libc::geteuid() } == 0 {
        if let Ok(path) = std::ffi::CString::new(dest.as_os_str().as_bytes()) {
            let result = unsafe { libc::lchown(path.as_ptr(), item.uid, item.gid) };
            if result != 0 {
                report.warnings.push(format!(
                    "{}: could not restore ownership: {}",
                    item.path,
                    std::io::Error::last_os_error()
                ));
            }
        }
    }

    if let Ok(path) = std::ffi::CString::new(dest.as_os_str().as_bytes()) {
        let times = [
            timespec_from_ns(item.atime_ns),
            timespec_from_ns(item.mtime_ns),
        ];
        let flags = if symlink { libc::AT_SYMLINK_NOFOLLOW } else { 0 };
        let result =
            unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), flags) };
        if result != 0 {
            report.warnings.push(format!(
                "{}: could not restore timestamps: {}",
                item.path,
                std::io::Error::last_os_error()
            ));
        }
    }
}

#[cfg(not(unix))]
fn apply_metadata(_dest: &Path, _item: &Item, _symlink: bool, _report: &mut ExtractReport) {}

#[cfg(unix)]
fn timespec_from_ns(ns: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: ns.div_euclid(1_000_000_000) as libc::time_t,
        tv_nsec: ns.rem_euclid(1_000_000_000) as libc::c_long,
    }
}
