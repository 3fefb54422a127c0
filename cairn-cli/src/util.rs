/*!
Shared plumbing for the subcommands: opening repositories (with the
passphrase dance), loading manifests, and keeping the client caches in
sync.
*/
use anyhow::{anyhow, Context, Result};
use cairn::cache::{cache_dir_for, ChunkIndex, FilesIndex};
use cairn::config::EngineConfig;
use cairn::manifest::Manifest;
use cairn::repository::{Repository, RepositoryError};

use std::path::{Path, PathBuf};

/// An open repository with its manifest and cache directory
pub struct Session {
    pub engine: EngineConfig,
    pub repo: Repository,
    pub manifest: Manifest,
    pub cache_dir: PathBuf,
}

/// Resolves the repository path, falling back to the configured default
pub fn repository_path(engine: &EngineConfig, given: &str) -> Result<PathBuf> {
    if !given.is_empty() {
        return Ok(PathBuf::from(given));
    }
    engine
        .default_repository
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("no repository given and CAIRN_REPOSITORY is not set"))
}

/// Prompts for a passphrase on the controlling terminal
pub fn prompt_passphrase(confirm: bool) -> Result<String> {
    let first = rpassword::read_password_from_tty(Some("Enter passphrase: "))
        .context("unable to read passphrase")?;
    if confirm {
        let second = rpassword::read_password_from_tty(Some("Enter same passphrase again: "))
            .context("unable to read passphrase")?;
        if first != second {
            return Err(anyhow!("passphrases do not match"));
        }
    }
    Ok(first)
}

/// Resolves the passphrase from the configured sources, prompting as the
/// last resort
pub fn passphrase_or_prompt(engine: &EngineConfig, confirm: bool) -> Result<String> {
    match engine.resolve_passphrase()? {
        Some(value) => Ok(value),
        None => prompt_passphrase(confirm),
    }
}

/// Opens a repository, prompting for a passphrase only when the
/// repository turns out to need one
pub fn open_repository(
    path: &Path,
    engine: &EngineConfig,
    writable: bool,
) -> Result<Repository> {
    let passphrase = engine.resolve_passphrase()?;
    match Repository::open(path, engine, passphrase.as_deref().map(str::as_bytes), writable) {
        Ok(repo) => Ok(repo),
        Err(RepositoryError::Key(cairn::repository::keys::KeyManagerError::PassphraseRequired)) => {
            let prompted = prompt_passphrase(false)?;
            Repository::open(path, engine, Some(prompted.as_bytes()), writable)
                .context("unable to open repository")
        }
        Err(err) => Err(err).context("unable to open repository"),
    }
}

/// Opens the repository and loads its manifest
pub fn open_session(repository: &str, writable: bool) -> Result<Session> {
    let engine = EngineConfig::from_env()?;
    let path = repository_path(&engine, repository)?;
    let mut repo = open_repository(&path, &engine, writable)?;
    let manifest = Manifest::load(&mut repo).context("unable to load manifest")?;
    let cache_dir = cache_dir_for(&engine, repo.config.id);
    Ok(Session {
        engine,
        repo,
        manifest,
        cache_dir,
    })
}

/// Loads the chunks index for the session's repository, resynchronising
/// it against the manifest when stale
pub fn load_chunk_index(session: &mut Session) -> Result<ChunkIndex> {
    let mut index = ChunkIndex::load(&session.cache_dir)?;
    index.resync(&mut session.repo, &session.manifest, &session.cache_dir)?;
    Ok(index)
}

/// Loads the files index for the given suffix
pub fn load_files_index(session: &Session, suffix: &str) -> Result<FilesIndex> {
    Ok(FilesIndex::load(
        &session.cache_dir,
        suffix,
        cairn::cache::files::DEFAULT_TTL,
    )?)
}
