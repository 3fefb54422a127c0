/*!
Environment-derived engine configuration.

All recognised environment inputs are collected once at startup into an
immutable record; nothing below the top level reads the environment. The
passphrase itself is resolved on demand (running a passphrase command is
observable, so it only happens when key material is actually needed), but
which sources exist is fixed here.
*/
use thiserror::Error;
use tracing::debug;

use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Error, Debug)]
pub enum EngineConfigError {
    #[error("I/O error resolving configuration")]
    IOError(#[from] std::io::Error),
    #[error("Passphrase command exited unsuccessfully")]
    PassCommandFailed,
    #[error("Passphrase file descriptor is not valid unicode or not readable")]
    BadPassphraseFd,
    #[error("No home directory available and no explicit directory overrides set")]
    NoHome,
}

type Result<T> = std::result::Result<T, EngineConfigError>;

/// Where a passphrase may come from, in priority order
#[derive(Clone, PartialEq, Eq)]
pub enum PassphraseSource {
    /// A literal passphrase from the environment
    Value(String),
    /// A command whose stdout (first line) is the passphrase
    Command(String),
    /// An inherited file descriptor to read the passphrase from
    Fd(i32),
    /// Nothing configured; the caller may prompt interactively
    Prompt,
}

impl std::fmt::Debug for PassphraseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The literal passphrase must never reach a log line
        match self {
            PassphraseSource::Value(_) => write!(f, "Value(<redacted>)"),
            PassphraseSource::Command(command) => write!(f, "Command({:?})", command),
            PassphraseSource::Fd(fd) => write!(f, "Fd({})", fd),
            PassphraseSource::Prompt => write!(f, "Prompt"),
        }
    }
}

/// The immutable engine configuration record
#[derive(Clone)]
pub struct EngineConfig {
    /// Default repository path used when the caller names none
    pub default_repository: Option<String>,
    pub passphrase: PassphraseSource,
    /// Replacement passphrase for key-change operations
    pub new_passphrase: Option<String>,
    /// Program used to reach remote repositories (transport)
    pub remote_program: String,
    /// Path of the engine binary on the remote side
    pub remote_path: String,
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub security_dir: PathBuf,
    pub keys_dir: PathBuf,
    /// Explicit key file location, overriding the keys directory lookup
    pub key_file: Option<PathBuf>,
    /// Overrides the computed host id in lock owner records
    pub host_id_override: Option<String>,
    /// Whether the crypto self test runs at startup
    pub self_test: bool,
    /// Named behaviour workarounds, comma separated in the environment
    pub workarounds: Vec<String>,
    /// Preferred FUSE backends, for the external mount integration
    pub fuse_backends: Vec<String>,
    /// Acknowledgement flag: accessing an unknown unencrypted repository
    /// is intentional
    pub allow_unencrypted_access: bool,
    /// Acknowledgement flag: a relocated repository is expected
    pub allow_relocated_repo: bool,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("default_repository", &self.default_repository)
            .field("passphrase", &self.passphrase)
            .field("new_passphrase", &self.new_passphrase.as_ref().map(|_| "<redacted>"))
            .field("remote_program", &self.remote_program)
            .field("remote_path", &self.remote_path)
            .field("cache_dir", &self.cache_dir)
            .field("config_dir", &self.config_dir)
            .field("security_dir", &self.security_dir)
            .field("keys_dir", &self.keys_dir)
            .field("key_file", &self.key_file)
            .field("host_id_override", &self.host_id_override)
            .field("self_test", &self.self_test)
            .field("workarounds", &self.workarounds)
            .field("fuse_backends", &self.fuse_backends)
            .field("allow_unencrypted_access", &self.allow_unencrypted_access)
            .field("allow_relocated_repo", &self.allow_relocated_repo)
            .finish()
    }
}

impl EngineConfig {
    /// Collects the configuration from the process environment
    pub fn from_env() -> Result<EngineConfig> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let passphrase = if let Some(value) = var("CAIRN_PASSPHRASE") {
            PassphraseSource::Value(value)
        } else if let Some(command) = var("CAIRN_PASSCOMMAND") {
            PassphraseSource::Command(command)
        } else if let Some(fd) = var("CAIRN_PASSPHRASE_FD").and_then(|v| v.parse().ok()) {
            PassphraseSource::Fd(fd)
        } else {
            PassphraseSource::Prompt
        };

        let home = var("HOME").map(PathBuf::from);
        let base_dir = |explicit: Option<String>, xdg: Option<String>, fallback: &str| {
            explicit
                .map(PathBuf::from)
                .or_else(|| xdg.map(|x| PathBuf::from(x).join("cairn")))
                .or_else(|| home.as_ref().map(|h| h.join(fallback).join("cairn")))
                .ok_or(EngineConfigError::NoHome)
        };
        let cache_dir = base_dir(var("CAIRN_CACHE_DIR"), var("XDG_CACHE_HOME"), ".cache")?;
        let config_dir = base_dir(var("CAIRN_CONFIG_DIR"), var("XDG_CONFIG_HOME"), ".config")?;
        let security_dir = var("CAIRN_SECURITY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("security"));
        let keys_dir = var("CAIRN_KEYS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("keys"));

        let list = |value: Option<String>| {
            value
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let config = EngineConfig {
            default_repository: var("CAIRN_REPOSITORY"),
            passphrase,
            new_passphrase: var("CAIRN_NEW_PASSPHRASE"),
            remote_program: var("CAIRN_REMOTE_PROGRAM").unwrap_or_else(|| "ssh".to_string()),
            remote_path: var("CAIRN_REMOTE_PATH").unwrap_or_else(|| "cairn".to_string()),
            cache_dir,
            config_dir,
            security_dir,
            keys_dir,
            key_file: var("CAIRN_KEY_FILE").map(PathBuf::from),
            host_id_override: var("CAIRN_HOST_ID"),
            self_test: var("CAIRN_SELFTEST").map_or(true, |v| v != "disabled"),
            workarounds: list(var("CAIRN_WORKAROUNDS")),
            fuse_backends: list(var("CAIRN_FUSE_BACKENDS")),
            allow_unencrypted_access: var("CAIRN_UNKNOWN_UNENCRYPTED_REPO_ACCESS_IS_OK")
                .map_or(false, |v| v == "yes"),
            allow_relocated_repo: var("CAIRN_RELOCATED_REPO_ACCESS_IS_OK")
                .map_or(false, |v| v == "yes"),
        };
        debug!("Collected engine configuration: {:?}", config);
        Ok(config)
    }

    /// A configuration with explicit directories and no environment input,
    /// for tests and embedding
    pub fn isolated(base: &Path) -> EngineConfig {
        EngineConfig {
            default_repository: None,
            passphrase: PassphraseSource::Prompt,
            new_passphrase: None,
            remote_program: "ssh".to_string(),
            remote_path: "cairn".to_string(),
            cache_dir: base.join("cache"),
            config_dir: base.join("config"),
            security_dir: base.join("security"),
            keys_dir: base.join("keys"),
            key_file: None,
            host_id_override: None,
            self_test: false,
            workarounds: Vec::new(),
            fuse_backends: Vec::new(),
            allow_unencrypted_access: false,
            allow_relocated_repo: false,
        }
    }

    /// Resolves the passphrase from the configured source.
    ///
    /// Returns `Ok(None)` when the only remaining source is an interactive
    /// prompt, which is the caller's (the CLI's) business.
    pub fn resolve_passphrase(&self) -> Result<Option<String>> {
        match &self.passphrase {
            PassphraseSource::Value(value) => Ok(Some(value.clone())),
            PassphraseSource::Command(command) => {
                let output = Command::new("sh").arg("-c").arg(command).output()?;
                if !output.status.success() {
                    return Err(EngineConfigError::PassCommandFailed);
                }
                let stdout =
                    String::from_utf8(output.stdout).map_err(|_| EngineConfigError::BadPassphraseFd)?;
                Ok(Some(stdout.lines().next().unwrap_or("").to_string()))
            }
            PassphraseSource::Fd(fd) => Ok(Some(read_passphrase_fd(*fd)?)),
            PassphraseSource::Prompt => Ok(None),
        }
    }

    /// A stable per-machine identifier, generated once and persisted in the
    /// config directory; combined with the hostname to form lock host ids
    pub fn node_id(&self) -> Result<String> {
        create_dir_all(&self.config_dir)?;
        let path = self.config_dir.join("nodeid");
        if path.exists() {
            let mut value = String::new();
            File::open(&path)?.read_to_string(&mut value)?;
            let value = value.trim().to_string();
            if !value.is_empty() {
                return Ok(value);
            }
        }
        let fresh = uuid::Uuid::new_v4().to_string();
        let mut file = File::create(&path)?;
        file.write_all(fresh.as_bytes())?;
        Ok(fresh)
    }
}

#[cfg(unix)]
fn read_passphrase_fd(fd: i32) -> Result<String> {
    use std::os::unix::io::FromRawFd;
    // Ownership of the descriptor passes to us; it is read once and closed
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut value = String::new();
    file.read_to_string(&mut value)
        .map_err(|_| EngineConfigError::BadPassphraseFd)?;
    Ok(value.trim_end_matches('\n').to_string())
}

#[cfg(not(unix))]
fn read_passphrase_fd(_fd: i32) -> Result<String> {
    Err(EngineConfigError::BadPassphraseFd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn isolated_config_has_sane_directories() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::isolated(dir.path());
        assert_eq!(config.cache_dir, dir.path().join("cache"));
        assert_eq!(config.security_dir, dir.path().join("security"));
        assert_eq!(config.passphrase, PassphraseSource::Prompt);
        assert_eq!(config.resolve_passphrase().unwrap(), None);
    }

    #[test]
    fn node_id_is_stable() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::isolated(dir.path());
        let first = config.node_id().unwrap();
        let second = config.node_id().unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn passphrase_value_resolves() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::isolated(dir.path());
        config.passphrase = PassphraseSource::Value("pw".to_string());
        assert_eq!(config.resolve_passphrase().unwrap(), Some("pw".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn passphrase_command_resolves() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::isolated(dir.path());
        config.passphrase = PassphraseSource::Command("echo secret".to_string());
        assert_eq!(
            config.resolve_passphrase().unwrap(),
            Some("secret".to_string())
        );
    }
}
