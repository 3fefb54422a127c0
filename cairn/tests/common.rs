#![allow(dead_code)]
use cairn::archive::{ArchiveOptions, ArchiveWriter};
use cairn::cache::{cache_dir_for, ChunkIndex, FilesIndex};
use cairn::config::EngineConfig;
use cairn::manifest::{Manifest, ManifestConfig};
use cairn::repository::{KeyMode, Repository};
use cairn::walker;
use cairn_core::archive::{ArchiveRecord, ChunkerParams};
use cairn_core::repository::{ChunkSettings, Codec, Compression, Encryption, HMAC};

use std::path::{Path, PathBuf};

pub const PASSPHRASE: &[u8] = b"pw";

/// Chunker parameters small enough that test files split into several
/// chunks
pub fn small_chunker() -> ChunkerParams {
    ChunkerParams {
        min_size: 64,
        max_size: 4096,
        mask_bits: 8,
        window_size: 48,
    }
}

pub fn test_settings() -> ChunkSettings {
    ChunkSettings {
        compression: Compression::Exact(Codec::ZStd { level: 1 }),
        encryption: Encryption::chacha20(0),
        hmac: HMAC::Blake2b,
    }
}

pub struct TestRepo {
    pub engine: EngineConfig,
    pub path: PathBuf,
    pub cache_dir: PathBuf,
}

impl TestRepo {
    /// Initialises a repokey repository with an empty manifest and small
    /// chunker parameters
    pub fn init(base: &Path) -> TestRepo {
        let engine = EngineConfig::isolated(&base.join("client"));
        let path = base.join("repo");
        let mut repo = Repository::init(
            &path,
            &engine,
            KeyMode::Repokey,
            test_settings(),
            PASSPHRASE,
            true,
        )
        .unwrap();
        let mut manifest = Manifest::empty(ManifestConfig {
            chunker: small_chunker(),
            compression: Compression::default(),
        });
        manifest.store(&mut repo).unwrap();
        repo.commit().unwrap();
        let cache_dir = cache_dir_for(&engine, repo.config.id);
        TestRepo {
            engine,
            path,
            cache_dir,
        }
    }

    pub fn open(&self, writable: bool) -> Repository {
        Repository::open(&self.path, &self.engine, Some(PASSPHRASE), writable).unwrap()
    }

    pub fn open_with_manifest(&self, writable: bool) -> (Repository, Manifest) {
        let mut repo = self.open(writable);
        let manifest = Manifest::load(&mut repo).unwrap();
        (repo, manifest)
    }

    pub fn load_caches(&self, repo: &mut Repository, manifest: &Manifest) -> (ChunkIndex, FilesIndex) {
        let mut chunks = ChunkIndex::load(&self.cache_dir).unwrap();
        chunks.resync(repo, manifest, &self.cache_dir).unwrap();
        let files = FilesIndex::load(&self.cache_dir, "", 20).unwrap();
        (chunks, files)
    }

    pub fn save_caches(&self, chunks: &ChunkIndex, files: &FilesIndex) {
        chunks.save(&self.cache_dir).unwrap();
        files.save(&self.cache_dir, "").unwrap();
    }

    /// Walks `source` and stores it as a new archive named `name`
    pub fn backup(&self, name: &str, source: &Path) -> ArchiveRecord {
        let (mut repo, mut manifest) = self.open_with_manifest(true);
        let (mut chunks, mut files) = self.load_caches(&mut repo, &manifest);
        let record = {
            let mut writer = ArchiveWriter::new(
                &mut repo,
                &mut manifest,
                &mut chunks,
                &mut files,
                name,
                ArchiveOptions::default(),
            )
            .unwrap();
            for entry in walker::walk(source, |_| true) {
                writer.add_entry(&entry).unwrap();
            }
            writer.finish().unwrap()
        };
        self.save_caches(&chunks, &files);
        record
    }

    /// Restores an archive into `target`
    pub fn restore(&self, name: &str, target: &Path) {
        let (mut repo, manifest) = self.open_with_manifest(false);
        let report = cairn::archive::extract(&mut repo, &manifest, name, target, |_| true).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }
}

/// Builds a little source tree: `a` is 1 MiB of zeros, `b` is the same
/// plus one trailing byte
pub fn build_zeros_tree(source: &Path) {
    std::fs::create_dir_all(source).unwrap();
    let zeros = vec![0_u8; 1024 * 1024];
    std::fs::write(source.join("a"), &zeros).unwrap();
    let mut b = zeros;
    b.push(b'x');
    std::fs::write(source.join("b"), &b).unwrap();
}
