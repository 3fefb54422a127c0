/*!
cairn stores many snapshots ("archives") of filesystem trees in a single
content-addressed repository, transferring and storing only
previously-unseen data. Every object persisted to the repository is
authenticated and optionally compressed and encrypted, so the repository
can live on untrusted storage; every archive is reconstructible from the
repository plus a repository key.

The engine is synchronous and single-writer: one exclusive lock holder
mutates a repository at a time, and a commit is only visible once the
manifest swap lands.
*/
#![warn(clippy::all)]

use byteorder::{BigEndian, WriteBytesExt};
use lazy_static::lazy_static;
use semver::Version;
use uuid::Uuid;

use std::convert::TryInto;

pub mod archive;
pub mod cache;
pub mod config;
pub mod manifest;
pub mod repository;
pub mod rpc;
pub mod walker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

lazy_static! {
    /// The pieces of the version string for this version of cairn
    pub static ref VERSION_PIECES: [u16; 3] = {
        let mut output = [0_u16; 3];
        let version = Version::parse(VERSION).expect("Unable to parse version");
        output[0] = version.major.try_into().expect("Major version too big");
        output[1] = version.minor.try_into().expect("Minor version too big");
        output[2] = version.patch.try_into().expect("Patch version too big");
        output
    };

    /// The version bytes for this version of cairn, the concatenation of
    /// major+minor+patch as u16s in network byte order
    pub static ref VERSION_BYTES: [u8; 6] = {
        let mut output = [0_u8; 6];
        let items = VERSION_PIECES.iter();
        assert!(items.len() == 3);
        let mut wrt: &mut [u8] = &mut output;
        for i in items {
            wrt.write_u16::<BigEndian>(*i).unwrap();
        }

        output
    };

    /// The UUID of this cairn implementation
    pub static ref IMPLEMENTATION_UUID: Uuid =
        Uuid::parse_str("6d25e1e7-b8a2-4070-a360-6e5a2b1f1bd4").unwrap();
}
