mod common;

use common::TestRepo;

use cairn::archive::{ArchiveOptions, ArchiveWriter};
use cairn::walker;

use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn eager_checkpoints() -> ArchiveOptions {
    ArchiveOptions {
        checkpoint_interval: Duration::from_secs(0),
        ..ArchiveOptions::default()
    }
}

// An interrupted backup leaves a restorable checkpoint archive behind,
// hidden from normal listings
#[test]
fn interrupted_backup_leaves_a_checkpoint() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("first"), vec![1_u8; 50_000]).unwrap();
    fs::write(source.join("second"), vec![2_u8; 50_000]).unwrap();

    let repo = TestRepo::init(base.path());

    // Feed some entries with a zero checkpoint interval, then "crash"
    // before finish
    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, mut files) = repo.load_caches(&mut repo_handle, &manifest);
        let mut writer = ArchiveWriter::new(
            &mut repo_handle,
            &mut manifest,
            &mut chunks,
            &mut files,
            "nightly",
            eager_checkpoints(),
        )
        .unwrap();
        for entry in walker::walk(&source, |_| true) {
            writer.add_entry(&entry).unwrap();
        }
        // writer dropped without finish
    }

    let (_repo_handle, manifest) = repo.open_with_manifest(false);
    // Hidden from the normal listing, visible when checkpoints are
    // considered
    assert!(manifest.list(false).is_empty());
    let names: Vec<String> = manifest.list(true).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["nightly.checkpoint".to_string()]);

    // And the checkpoint is restorable
    let target = base.path().join("out");
    repo.restore("nightly.checkpoint", &target);
}

// Completing the backup supersedes the checkpoint; retrying after an
// interruption cleans the stale one up
#[test]
fn finished_backup_supersedes_the_checkpoint() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("file"), vec![3_u8; 80_000]).unwrap();

    let repo = TestRepo::init(base.path());

    // First attempt: interrupted after checkpointing
    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, mut files) = repo.load_caches(&mut repo_handle, &manifest);
        let mut writer = ArchiveWriter::new(
            &mut repo_handle,
            &mut manifest,
            &mut chunks,
            &mut files,
            "nightly",
            eager_checkpoints(),
        )
        .unwrap();
        for entry in walker::walk(&source, |_| true) {
            writer.add_entry(&entry).unwrap();
        }
    }

    // Second attempt completes
    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, mut files) = repo.load_caches(&mut repo_handle, &manifest);
        let mut writer = ArchiveWriter::new(
            &mut repo_handle,
            &mut manifest,
            &mut chunks,
            &mut files,
            "nightly",
            ArchiveOptions::default(),
        )
        .unwrap();
        for entry in walker::walk(&source, |_| true) {
            writer.add_entry(&entry).unwrap();
        }
        writer.finish().unwrap();
        repo.save_caches(&chunks, &files);
    }

    let (_repo_handle, manifest) = repo.open_with_manifest(false);
    let names: Vec<String> = manifest.list(true).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["nightly".to_string()]);
}
