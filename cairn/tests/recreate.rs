mod common;

use common::TestRepo;

use cairn::archive::{load_archive_by_name, recreate};
use cairn_core::archive::ChunkerParams;
use cairn_core::repository::{Codec, Compression};

use rand::prelude::*;
use std::fs;
use tempfile::tempdir;

// Recreating an archive with different chunker parameters preserves the
// items and their content exactly
#[test]
fn recreate_preserves_content() {
    let base = tempdir().unwrap();
    let source = base.path().join("src");
    fs::create_dir_all(&source).unwrap();
    let mut content = vec![0_u8; 150_000];
    SmallRng::seed_from_u64(7).fill_bytes(&mut content);
    fs::write(source.join("data"), &content).unwrap();
    fs::write(source.join("small"), b"tiny").unwrap();

    let repo = TestRepo::init(base.path());
    repo.backup("snap", &source);

    let new_params = ChunkerParams {
        min_size: 128,
        max_size: 8192,
        mask_bits: 10,
        window_size: 48,
    };
    {
        let (mut repo_handle, mut manifest) = repo.open_with_manifest(true);
        let (mut chunks, files) = repo.load_caches(&mut repo_handle, &manifest);
        recreate(
            &mut repo_handle,
            &mut manifest,
            &mut chunks,
            "snap",
            Some(new_params),
            Some(Compression::Exact(Codec::LZ4 { level: 1 })),
        )
        .unwrap();
        repo.save_caches(&chunks, &files);
    }

    // The archive now carries the new parameters
    {
        let (mut repo_handle, manifest) = repo.open_with_manifest(false);
        let (_, record) = load_archive_by_name(&mut repo_handle, &manifest, "snap").unwrap();
        assert_eq!(record.chunker, new_params);
    }

    // Content is bit-identical after the rewrite
    let target = base.path().join("out");
    repo.restore("snap", &target);
    let restored = target
        .join(source.strip_prefix("/").unwrap_or(&source))
        .join("data");
    assert_eq!(fs::read(restored).unwrap(), content);
}
