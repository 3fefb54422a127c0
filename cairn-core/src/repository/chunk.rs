/*!
The object envelope: the lowest level of abstraction in a cairn repository.

An object is an arbitrary byte sequence, keyed by a keyed hash of its plain
text, carried on disk as a compressed, encrypted, MAC-tagged blob. The
plain text is prefixed with a one-byte kind tag identifying what the object
is (manifest, archive metadata, item stream, or file data), so that a
repository can be audited without consulting anything but the objects
themselves.
*/
use super::{Compression, Encryption, Key, HMAC};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::cmp;
use std::fmt;

/// Error for all the various things that can go wrong with handling objects
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Compression Error")]
    CompressionError(#[from] super::CompressionError),
    #[error("Encryption Error")]
    EncryptionError(#[from] super::EncryptionError),
    #[error("MAC validation failed")]
    MacValidationFailed,
    #[error("Decrypted plain text does not hash back to the object's id")]
    IdMismatch,
    #[error("Object carries unknown kind tag {0:#04x}")]
    UnknownObjectKind(u8),
    #[error("Object plain text is empty")]
    EmptyObject,
}

type Result<T> = std::result::Result<T, ChunkError>;

/// Key used for indexing an object in a repository.
///
/// Derived from a keyed hash of the object's plain text XORed with the
/// repository's id seed; two objects with the same id are assumed to carry
/// identical plain text.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Serialize, Deserialize, Hash)]
pub struct ChunkId {
    /// Ids are a bytestring of length 32.
    ///
    /// Longer keyed-hash outputs are truncated and shorter ones (not
    /// recommended) padded with zeros at the end.
    id: [u8; 32],
}

impl ChunkId {
    /// Will create a new id from a slice.
    ///
    /// Ids longer than 32 bytes will be truncated, shorter ones padded.
    pub fn new(input_id: &[u8]) -> ChunkId {
        let mut id: [u8; 32] = [0; 32];
        id[..cmp::min(32, input_id.len())]
            .clone_from_slice(&input_id[..cmp::min(32, input_id.len())]);
        ChunkId { id }
    }

    /// Computes the id of a plain text under the given key material.
    ///
    /// The id is the keyed hash of the plain text under the id key, XORed
    /// with the repository's id seed. It is stable across re-encryption of
    /// the same plain text.
    pub fn compute(data: &[u8], hmac: HMAC, key: &Key) -> ChunkId {
        let mut id = ChunkId::new(&hmac.id(data, key)).id;
        for (byte, seed) in id.iter_mut().zip(key.id_seed().iter()) {
            *byte ^= seed;
        }
        ChunkId { id }
    }

    /// Provides a reference to an id's raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.id
    }

    /// Returns the special all-zero id the manifest lives at
    pub fn manifest_id() -> ChunkId {
        ChunkId { id: [0_u8; 32] }
    }

    /// Returns a random id, used for testing
    pub fn random_id() -> ChunkId {
        let id = rand::random();
        ChunkId { id }
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.id {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Kind tag carried in the first plain-text byte of every object
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Manifest,
    Archive,
    ItemStream,
    Data,
}

impl ObjectKind {
    pub fn as_byte(self) -> u8 {
        match self {
            ObjectKind::Manifest => 0,
            ObjectKind::Archive => 1,
            ObjectKind::ItemStream => 2,
            ObjectKind::Data => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<ObjectKind> {
        match byte {
            0 => Ok(ObjectKind::Manifest),
            1 => Ok(ObjectKind::Archive),
            2 => Ok(ObjectKind::ItemStream),
            3 => Ok(ObjectKind::Data),
            unknown => Err(ChunkError::UnknownObjectKind(unknown)),
        }
    }
}

/// Encapsulates the compression, encryption, and keyed-hash selections used
/// for new objects.
///
/// The `encryption` field acts as an algorithm template; the per-object
/// nonce is substituted at pack time.
#[derive(Serialize, Deserialize, Clone, Debug, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    pub compression: Compression,
    pub encryption: Encryption,
    pub hmac: HMAC,
}

impl ChunkSettings {
    /// Returns a `ChunkSettings` with no compression, no encryption, and
    /// `HMAC::Blake2b`: very nearly the least computationally intensive
    /// settings cairn supports.
    pub fn lightweight() -> ChunkSettings {
        ChunkSettings {
            compression: Compression::Exact(super::Codec::NoCompression),
            encryption: Encryption::NoEncryption,
            hmac: HMAC::Blake2b,
        }
    }
}

/// A binary blob, ready to be committed to storage.
///
/// Data in a `Chunk` has already undergone compression and encryption, and
/// carries a MAC tag over its cipher text. The MAC uses the MAC key, which
/// is unrelated to the id key producing the `ChunkId`.
///
/// The compression codec is identified by the first byte of the (decrypted)
/// payload; the encryption tag, including the nonce used, rides alongside
/// the cipher text.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Chunk {
    /// The cipher text of the object
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    /// Encryption algorithm used, also stores the nonce
    encryption: Encryption,
    /// Keyed-hash algorithm used for the MAC and the id
    hmac: HMAC,
    /// MAC tag of the cipher text bytes of this object
    #[serde(with = "serde_bytes")]
    mac: Vec<u8>,
    /// Id, used for indexing in the repository and deduplication
    id: ChunkId,
}

impl Chunk {
    /// Produces a `Chunk` from the given plain text, deriving its id from
    /// the key material.
    ///
    /// # Panics
    ///
    /// Will panic if compression fails, which would represent a programming
    /// oversight the caller cannot recover from safely.
    pub fn pack(
        data: &[u8],
        kind: ObjectKind,
        compression: Compression,
        encryption: Encryption,
        hmac: HMAC,
        key: &Key,
    ) -> Chunk {
        let id = ChunkId::compute(data, hmac, key);
        Chunk::pack_with_id(data, kind, compression, encryption, hmac, key, id)
    }

    /// Produces a `Chunk` using the provided settings, but overriding the
    /// id.
    ///
    /// Used for the manifest, which lives at a fixed well-known id instead
    /// of a content-derived one. Using this with any other id has the
    /// potential to do serious damage to a repository.
    pub fn pack_with_id(
        data: &[u8],
        kind: ObjectKind,
        compression: Compression,
        encryption: Encryption,
        hmac: HMAC,
        key: &Key,
        id: ChunkId,
    ) -> Chunk {
        let mut plain = Vec::with_capacity(data.len() + 1);
        plain.push(kind.as_byte());
        plain.extend_from_slice(data);
        let compressed = compression.compress(&plain);
        let data = encryption.encrypt(&compressed, key);
        let mac = hmac.mac(&data, key);
        Chunk {
            data,
            encryption,
            hmac,
            mac,
            id,
        }
    }

    /// Constructs a `Chunk` from its raw parts.
    ///
    /// This has potentially dangerous consequences if done incorrectly, and
    /// should be avoided if another method is available.
    pub fn from_parts(
        data: Vec<u8>,
        encryption: Encryption,
        hmac: HMAC,
        mac: Vec<u8>,
        id: ChunkId,
    ) -> Chunk {
        Chunk {
            data,
            encryption,
            hmac,
            mac,
            id,
        }
    }

    /// Validates, decrypts, and decompresses the data in a `Chunk`,
    /// returning its kind tag and plain text.
    ///
    /// After decryption the plain text is re-hashed and compared against the
    /// object's id (except for the manifest, whose id is not
    /// content-derived).
    ///
    /// # Errors
    ///
    /// Will return `Err(MacValidationFailed)` on MAC mismatch,
    /// `Err(IdMismatch)` when the plain text does not hash back to the id,
    /// and `Err(CompressionError)`/`Err(UnknownObjectKind)` for corrupt
    /// payloads. All of these indicate the object is corrupted or otherwise
    /// tampered with.
    pub fn unpack(&self, key: &Key) -> Result<(ObjectKind, Vec<u8>)> {
        if !self.hmac.verify_hmac(&self.mac, &self.data, key) {
            return Err(ChunkError::MacValidationFailed);
        }
        let decrypted = self.encryption.decrypt(&self.data, key)?;
        let decompressed = Compression::decompress(&decrypted)?;
        let (&kind_byte, plain) = decompressed.split_first().ok_or(ChunkError::EmptyObject)?;
        let kind = ObjectKind::from_byte(kind_byte)?;
        if self.id != ChunkId::manifest_id() && ChunkId::compute(plain, self.hmac, key) != self.id {
            return Err(ChunkError::IdMismatch);
        }
        Ok((kind, plain.to_vec()))
    }

    /// Returns the length in bytes of the stored cipher text
    pub fn csize(&self) -> usize {
        self.data.len()
    }

    /// Determine if this chunk is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a reference to the raw stored bytes of this chunk
    pub fn get_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the id associated with the data in this chunk
    pub fn get_id(&self) -> ChunkId {
        self.id
    }

    /// Returns the MAC tag of this chunk
    pub fn mac(&self) -> Vec<u8> {
        self.mac.clone()
    }

    /// Returns a copy of the encryption tag (and nonce) used for this chunk
    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    #[cfg(test)]
    /// Testing only function used to corrupt the data
    pub fn break_data(&mut self, index: usize) {
        let val = self.data[index];
        if val == 0 {
            self.data[index] = 1;
        } else {
            self.data[index] = 0;
        }
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data == other.data
    }
}

impl Eq for Chunk {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Codec;

    fn chunk_with_settings(compression: Compression, encryption: Encryption, hmac: HMAC) {
        let data_string =
            "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor \
             incididunt ut labore et dolore magna aliqua.";
        let key = Key::random(32);
        let packed = Chunk::pack(
            data_string.as_bytes(),
            ObjectKind::Data,
            compression,
            encryption,
            hmac,
            &key,
        );

        let (kind, output) = packed.unpack(&key).expect("Failed to unpack chunk");

        assert_eq!(kind, ObjectKind::Data);
        assert_eq!(data_string.as_bytes().to_vec(), output);
    }

    #[test]
    fn all_combos() {
        let compressions = [
            Compression::Exact(Codec::NoCompression),
            Compression::Exact(Codec::ZStd { level: 1 }),
            Compression::Exact(Codec::LZ4 { level: 1 }),
            Compression::Exact(Codec::Zlib { level: 6 }),
            Compression::Exact(Codec::LZMA { level: 1 }),
            Compression::Auto,
        ];
        let encryptions = [
            Encryption::NoEncryption,
            Encryption::aes256ctr(1),
            Encryption::chacha20(1),
        ];
        let hmacs = [
            HMAC::SHA256,
            HMAC::Blake2b,
            HMAC::Blake2bp,
            HMAC::Blake3,
            HMAC::SHA3,
        ];
        for c in compressions.iter() {
            for e in encryptions.iter() {
                for h in hmacs.iter() {
                    chunk_with_settings(*c, *e, *h);
                }
            }
        }
    }

    #[test]
    fn detect_bad_data() {
        let key = Key::random(32);
        let mut packed = Chunk::pack(
            b"I am but a humble test string",
            ObjectKind::Data,
            Compression::Exact(Codec::NoCompression),
            Encryption::NoEncryption,
            HMAC::SHA256,
            &key,
        );
        packed.break_data(5);

        assert!(matches!(
            packed.unpack(&key),
            Err(ChunkError::MacValidationFailed)
        ));
    }

    #[test]
    fn id_is_stable_across_nonces() {
        let key = Key::random(32);
        let data = b"same plain text, different nonce";
        let a = Chunk::pack(
            data,
            ObjectKind::Data,
            Compression::Auto,
            Encryption::chacha20(1),
            HMAC::Blake2b,
            &key,
        );
        let b = Chunk::pack(
            data,
            ObjectKind::Data,
            Compression::Auto,
            Encryption::chacha20(2),
            HMAC::Blake2b,
            &key,
        );
        assert_eq!(a.get_id(), b.get_id());
        assert_ne!(a.get_bytes(), b.get_bytes());
    }

    #[test]
    fn id_depends_on_key_material() {
        let key1 = Key::random(32);
        let key2 = Key::random(32);
        let data = b"identical plain text";
        let id1 = ChunkId::compute(data, HMAC::Blake2b, &key1);
        let id2 = ChunkId::compute(data, HMAC::Blake2b, &key2);
        assert_ne!(id1, id2);
    }

    #[test]
    fn manifest_id_skips_content_check() {
        let key = Key::random(32);
        let packed = Chunk::pack_with_id(
            b"manifest-ish content",
            ObjectKind::Manifest,
            Compression::Auto,
            Encryption::NoEncryption,
            HMAC::Blake2b,
            &key,
            ChunkId::manifest_id(),
        );
        let (kind, plain) = packed.unpack(&key).unwrap();
        assert_eq!(kind, ObjectKind::Manifest);
        assert_eq!(plain, b"manifest-ish content".to_vec());
    }
}
