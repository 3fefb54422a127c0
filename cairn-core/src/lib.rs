/*!
`cairn-core` provides the data structures shared by every layer of the cairn
backup engine: the object envelope and its compression/encryption/keyed-hash
tags, the repository key material, and the serialised records that make up
archives (items, item streams, and archive metadata).

Nothing in this crate touches the disk; persistence and transaction logic
live in the `cairn` crate.
*/
#![warn(clippy::all)]

pub mod archive;
pub mod repository;
