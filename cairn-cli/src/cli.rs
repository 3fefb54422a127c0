/*!
The `cli` module provides the data types used for parsing the command line
arguments, as well as conversions from those types to their equivalents in
`cairn` proper.
*/
use anyhow::{anyhow, Result};
use cairn::archive::PrunePolicy;
use cairn::repository::KeyMode;
use cairn_core::archive::ChunkerParams;
use cairn_core::repository::{ChunkSettings, Compression, Encryption, HMAC};
use clap::{arg_enum, AppSettings};
use structopt::StructOpt;

use std::path::PathBuf;
use std::time::Duration;

/// The version + git commit + build date string the program identifies
/// itself with
const VERSION: &str = concat!(
    env!("VERGEN_SEMVER"),
    "-",
    env!("VERGEN_SHA_SHORT"),
    " ",
    env!("VERGEN_BUILD_DATE"),
);

arg_enum! {
    /// How key material for a new repository is stored
    #[derive(Debug, Clone, Copy)]
    pub enum KeyLocation {
        None,
        Repokey,
        Keyfile,
    }
}

arg_enum! {
    /// The encryption cipher for a new repository
    #[derive(Debug, Clone, Copy)]
    pub enum Cipher {
        AES256CTR,
        ChaCha20,
        None,
    }
}

arg_enum! {
    /// The keyed-hash algorithm for a new repository
    #[derive(Debug, Clone, Copy)]
    pub enum IdHash {
        SHA256,
        Blake2b,
        Blake2bp,
        Blake3,
        SHA3,
    }
}

impl From<KeyLocation> for KeyMode {
    fn from(value: KeyLocation) -> KeyMode {
        match value {
            KeyLocation::None => KeyMode::None,
            KeyLocation::Repokey => KeyMode::Repokey,
            KeyLocation::Keyfile => KeyMode::Keyfile,
        }
    }
}

/// Indicates which subcommand the user has chosen
#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Initializes a new repository
    Init {
        /// Location of the new repository
        #[structopt(name = "REPOSITORY")]
        repository: String,
        /// Where to keep the key material
        #[structopt(
            short = "e",
            long,
            default_value = "Repokey",
            case_insensitive(true),
            possible_values(&KeyLocation::variants())
        )]
        key_mode: KeyLocation,
        /// Encryption cipher for objects
        #[structopt(
            long,
            default_value = "ChaCha20",
            case_insensitive(true),
            possible_values(&Cipher::variants())
        )]
        cipher: Cipher,
        /// Compression spec, e.g. "auto", "zstd,3", "obfuscate,3,lz4"
        #[structopt(short, long, default_value = "auto")]
        compression: String,
        /// Keyed-hash algorithm for chunk ids and MACs
        #[structopt(
            long,
            default_value = "Blake2b",
            case_insensitive(true),
            possible_values(&IdHash::variants())
        )]
        id_hash: IdHash,
        /// Do not require an authentication tag on the manifest
        #[structopt(long)]
        no_tam: bool,
    },
    /// Creates a new archive from the given paths
    Create {
        /// Archive to create, as REPOSITORY::NAME (placeholders allowed)
        #[structopt(name = "ARCHIVE")]
        archive: String,
        /// Paths to back up
        #[structopt(name = "PATH", required = true)]
        paths: Vec<PathBuf>,
        /// Glob patterns for paths to exclude
        #[structopt(short, long)]
        exclude: Vec<String>,
        /// Free-form comment stored with the archive
        #[structopt(long, default_value = "")]
        comment: String,
        /// Seconds between checkpoint archives during long backups
        #[structopt(long, default_value = "1800")]
        checkpoint_interval: u64,
        /// Suffix selecting a separate files cache for this source set
        #[structopt(long, default_value = "")]
        files_cache_suffix: String,
    },
    /// Restores an archive to a target directory
    Extract {
        /// Archive to restore, as REPOSITORY::NAME
        #[structopt(name = "ARCHIVE")]
        archive: String,
        /// Directory to restore into
        #[structopt(name = "TARGET", default_value = ".")]
        target: PathBuf,
        /// Glob patterns selecting which stored paths to restore
        #[structopt(short, long)]
        include: Vec<String>,
    },
    /// Lists archives, or the contents of one archive
    List {
        /// REPOSITORY or REPOSITORY::ARCHIVE
        #[structopt(name = "TARGET")]
        target: String,
        /// Show checkpoint archives too
        #[structopt(long)]
        consider_checkpoints: bool,
    },
    /// Shows detailed information about an archive
    Info {
        /// Archive to inspect, as REPOSITORY::NAME
        #[structopt(name = "ARCHIVE")]
        archive: String,
    },
    /// Deletes an archive
    Delete {
        /// Archive to delete, as REPOSITORY::NAME
        #[structopt(name = "ARCHIVE")]
        archive: String,
    },
    /// Applies a retention policy to the archive list
    Prune {
        #[structopt(name = "REPOSITORY")]
        repository: String,
        #[structopt(long, default_value = "0")]
        keep_last: usize,
        #[structopt(long, default_value = "0")]
        keep_hourly: usize,
        #[structopt(long, default_value = "0")]
        keep_daily: usize,
        #[structopt(long, default_value = "0")]
        keep_weekly: usize,
        #[structopt(long, default_value = "0")]
        keep_monthly: usize,
        #[structopt(long, default_value = "0")]
        keep_yearly: usize,
        /// Only report what would be deleted
        #[structopt(long)]
        dry_run: bool,
    },
    /// Verifies repository and archive consistency
    Check {
        #[structopt(name = "REPOSITORY")]
        repository: String,
        /// Decrypt every object and re-verify its id
        #[structopt(long)]
        verify_data: bool,
        /// Attempt to repair what the check finds
        #[structopt(long)]
        repair: bool,
        /// Bound the storage check to roughly this many seconds; the next
        /// check resumes where this one stopped
        #[structopt(long)]
        max_duration: Option<u64>,
        /// Check only the storage layer, not the archive graph
        #[structopt(long)]
        repository_only: bool,
    },
    /// Rewrites sparse segments to reclaim space
    Compact {
        #[structopt(name = "REPOSITORY")]
        repository: String,
    },
    /// Re-chunks an archive with different parameters
    Recreate {
        /// Archive to rewrite, as REPOSITORY::NAME
        #[structopt(name = "ARCHIVE")]
        archive: String,
        /// New chunker parameters as MIN,MAX,MASK_BITS,WINDOW
        #[structopt(long)]
        chunker_params: Option<String>,
        /// New compression spec
        #[structopt(long)]
        compression: Option<String>,
    },
    /// Key management
    Key(KeyCommand),
    /// Attaches an authentication tag to a manifest created before TAM was
    /// required
    TamUpgrade {
        #[structopt(name = "REPOSITORY")]
        repository: String,
    },
    /// Removes a stale lock after operator confirmation
    BreakLock {
        #[structopt(name = "REPOSITORY")]
        repository: String,
    },
    /// Serves repository operations over stdin/stdout (used by remote
    /// access)
    Serve,
}

#[derive(StructOpt, Debug, Clone)]
pub enum KeyCommand {
    /// Re-wraps the key material under a new passphrase
    ChangePassphrase {
        #[structopt(name = "REPOSITORY")]
        repository: String,
    },
}

/// Struct for holding the options the user has selected
#[derive(StructOpt, Debug)]
#[structopt(
    name = "cairn",
    about = "Deduplicating, encrypting, tamper evident backup tool",
    author = env!("CARGO_PKG_AUTHORS"),
    version = VERSION,
    global_setting(AppSettings::ColoredHelp),
)]
pub struct Opt {
    /// Increases log verbosity (repeatable)
    #[structopt(short, long, parse(from_occurrences), global = true)]
    pub verbose: u8,
    /// Operation to perform
    #[structopt(subcommand)]
    pub command: Command,
}

/// Splits a REPOSITORY::ARCHIVE location into its parts
pub fn split_location(location: &str) -> (String, Option<String>) {
    match location.find("::") {
        Some(at) => (
            location[..at].to_string(),
            Some(location[at + 2..].to_string()),
        ),
        None => (location.to_string(), None),
    }
}

/// Like `split_location`, but the archive part is mandatory
pub fn split_archive_location(location: &str) -> Result<(String, String)> {
    match split_location(location) {
        (repository, Some(archive)) if !archive.is_empty() => Ok((repository, archive)),
        _ => Err(anyhow!(
            "expected REPOSITORY::ARCHIVE, got {:?}",
            location
        )),
    }
}

/// Builds the chunk settings for a new repository from the init options
pub fn settings_for_init(cipher: Cipher, compression: &str, id_hash: IdHash) -> Result<ChunkSettings> {
    let compression = Compression::parse(compression)
        .map_err(|err| anyhow!("invalid compression spec: {}", err))?;
    let encryption = match cipher {
        Cipher::AES256CTR => Encryption::aes256ctr(0),
        Cipher::ChaCha20 => Encryption::chacha20(0),
        Cipher::None => Encryption::NoEncryption,
    };
    let hmac = match id_hash {
        IdHash::SHA256 => HMAC::SHA256,
        IdHash::Blake2b => HMAC::Blake2b,
        IdHash::Blake2bp => HMAC::Blake2bp,
        IdHash::Blake3 => HMAC::Blake3,
        IdHash::SHA3 => HMAC::SHA3,
    };
    Ok(ChunkSettings {
        compression,
        encryption,
        hmac,
    })
}

/// Parses MIN,MAX,MASK_BITS,WINDOW into chunker parameters
pub fn parse_chunker_params(value: &str) -> Result<ChunkerParams> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(anyhow!(
            "expected MIN,MAX,MASK_BITS,WINDOW, got {:?}",
            value
        ));
    }
    let parse = |part: &str| -> Result<u32> {
        part.parse()
            .map_err(|_| anyhow!("{:?} is not a number", part))
    };
    let params = ChunkerParams {
        min_size: parse(parts[0])?,
        max_size: parse(parts[1])?,
        mask_bits: parse(parts[2])?,
        window_size: parse(parts[3])?,
    };
    if params.min_size == 0 || params.max_size < params.min_size {
        return Err(anyhow!("chunker bounds are inconsistent"));
    }
    Ok(params)
}

impl Command {
    /// Builds the prune policy from the prune options
    pub fn prune_policy(&self) -> Option<PrunePolicy> {
        if let Command::Prune {
            keep_last,
            keep_hourly,
            keep_daily,
            keep_weekly,
            keep_monthly,
            keep_yearly,
            ..
        } = self
        {
            Some(PrunePolicy {
                keep_last: *keep_last,
                keep_hourly: *keep_hourly,
                keep_daily: *keep_daily,
                keep_weekly: *keep_weekly,
                keep_monthly: *keep_monthly,
                keep_yearly: *keep_yearly,
            })
        } else {
            None
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        if let Command::Check { max_duration, .. } = self {
            max_duration.map(Duration::from_secs)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_splitting() {
        assert_eq!(split_location("/r"), ("/r".to_string(), None));
        assert_eq!(
            split_location("/r::nightly"),
            ("/r".to_string(), Some("nightly".to_string()))
        );
        assert!(split_archive_location("/r").is_err());
        assert!(split_archive_location("/r::").is_err());
        assert_eq!(
            split_archive_location("/r::a").unwrap(),
            ("/r".to_string(), "a".to_string())
        );
    }

    #[test]
    fn chunker_params_parsing() {
        let params = parse_chunker_params("1024,65536,14,4095").unwrap();
        assert_eq!(params.min_size, 1024);
        assert_eq!(params.max_size, 65536);
        assert!(parse_chunker_params("1,2,3").is_err());
        assert!(parse_chunker_params("0,10,3,4").is_err());
    }
}
