/*!
Data structures for objects as the repository stores them.

An object is a compressed, encrypted, MAC-tagged blob keyed by a 256-bit
keyed hash of its plain text. The submodules provide the selectable
compression codecs, encryption modes, and keyed-hash algorithms, as well as
the repository key material and its passphrase wrapping.
*/

pub mod chunk;
pub mod compression;
pub mod encryption;
pub mod hmac;
pub mod key;

pub use chunk::{Chunk, ChunkError, ChunkId, ChunkSettings, ObjectKind};
pub use compression::{Codec, Compression, CompressionError, PaddingSpec};
pub use encryption::{Encryption, EncryptionError};
pub use hmac::HMAC;
pub use key::{EncryptedKey, Key, KeyError};

/// Startup self test of the crypto primitives.
///
/// Packs and unpacks a fixed vector under every cipher and keyed-hash
/// selection, and confirms that tampering is detected. A machine where any
/// of this fails must not be trusted to write backups.
pub fn self_test() -> Result<(), ChunkError> {
    let key = Key::random(32);
    let data = b"cairn self test vector";
    for encryption in &[
        Encryption::NoEncryption,
        Encryption::aes256ctr(1),
        Encryption::chacha20(1),
    ] {
        for hmac in &[
            HMAC::SHA256,
            HMAC::Blake2b,
            HMAC::Blake2bp,
            HMAC::Blake3,
            HMAC::SHA3,
        ] {
            let chunk = Chunk::pack(
                data,
                ObjectKind::Data,
                Compression::Auto,
                *encryption,
                *hmac,
                &key,
            );
            let (kind, plain) = chunk.unpack(&key)?;
            if kind != ObjectKind::Data || plain != data.to_vec() {
                return Err(ChunkError::IdMismatch);
            }
            let broken = Chunk::from_parts(
                chunk.get_bytes().iter().map(|b| b ^ 1).collect(),
                chunk.encryption(),
                *hmac,
                chunk.mac(),
                chunk.get_id(),
            );
            if broken.unpack(&key).is_ok() {
                return Err(ChunkError::MacValidationFailed);
            }
        }
    }
    Ok(())
}
