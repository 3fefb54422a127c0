mod common;

use common::{build_zeros_tree, TestRepo};

use cairn::archive::{prune, PrunePolicy};

use std::fs;
use tempfile::tempdir;

// Spec scenario: keep-last-2 over archives t1 < t2 < t3 < t4 deletes t1
// and t2, deterministically
#[test]
fn keep_last_two_deletes_the_two_oldest() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    build_zeros_tree(&source);

    let repo = TestRepo::init(base.path());
    for name in &["t1", "t2", "t3", "t4"] {
        repo.backup(name, &source);
        // Archive timestamps need a strict order
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let policy = PrunePolicy {
        keep_last: 2,
        ..PrunePolicy::default()
    };

    // A dry run decides the same set without deleting anything
    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, _files) = repo.load_caches(&mut repo_handle, &manifest);
        let report = prune(&mut repo_handle, &mut manifest, &mut chunks, &policy, true).unwrap();
        assert_eq!(report.deleted, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(manifest.list(false).len(), 4);
    }

    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, files) = repo.load_caches(&mut repo_handle, &manifest);
        let report = prune(&mut repo_handle, &mut manifest, &mut chunks, &policy, false).unwrap();
        assert_eq!(report.deleted.len(), 2);
        repo.save_caches(&chunks, &files);
    }

    let (_repo_handle, manifest) = repo.open_with_manifest(false);
    let names: Vec<String> = manifest.list(false).into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["t3".to_string(), "t4".to_string()]);
}

// Pruning twice with the same policy is idempotent
#[test]
fn prune_is_idempotent() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    build_zeros_tree(&source);

    let repo = TestRepo::init(base.path());
    for name in &["a", "b", "c"] {
        repo.backup(name, &source);
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let policy = PrunePolicy {
        keep_last: 2,
        ..PrunePolicy::default()
    };
    for _ in 0..2 {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, files) = repo.load_caches(&mut repo_handle, &manifest);
        prune(&mut repo_handle, &mut manifest, &mut chunks, &policy, false).unwrap();
        repo.save_caches(&chunks, &files);
    }

    let (_repo_handle, manifest) = repo.open_with_manifest(false);
    assert_eq!(manifest.list(false).len(), 2);
}

// Pruned chunks are reclaimable: after prune and compact, the repository
// shrinks on disk while the survivors stay restorable
#[test]
fn prune_then_compact_reclaims_space() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    fs::create_dir_all(&source).unwrap();

    let repo = TestRepo::init(base.path());
    // Each archive gets unique incompressible-ish content
    for generation in 0..3_u8 {
        let content: Vec<u8> = (0..300_000_usize)
            .map(|i| (i as u8).wrapping_mul(97).wrapping_add(generation))
            .collect();
        fs::write(source.join("data"), &content).unwrap();
        repo.backup(&format!("gen{}", generation), &source);
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    let disk_before = repo_size(&repo.path);

    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, files) = repo.load_caches(&mut repo_handle, &manifest);
        let policy = PrunePolicy {
            keep_last: 1,
            ..PrunePolicy::default()
        };
        prune(&mut repo_handle, &mut manifest, &mut chunks, &policy, false).unwrap();
        repo.save_caches(&chunks, &files);
        repo_handle.compact().unwrap();
    }

    let disk_after = repo_size(&repo.path);
    assert!(disk_after < disk_before);

    let target = base.path().join("out");
    repo.restore("gen2", &target);
}

fn repo_size(path: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(path.join("data"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
