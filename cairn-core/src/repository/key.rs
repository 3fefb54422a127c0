/*!
Repository key material and its passphrase wrapping.

A repository carries four pieces of secret material: the encryption key, the
MAC key used for integrity tags, the id key used for chunk identity, and a
32-byte id seed XORed into every chunk id for domain separation between
repositories. A chunker nonce randomizes the content-defined chunker's
lookup table so chunk sizes cannot fingerprint known plain text.

Key material is stored wrapped: serialized with CBOR and encrypted under a
key encryption key derived from the user passphrase with argon2id.
*/
use crate::repository::{Encryption, HMAC};

use argon2::{self, Config, ThreadMode, Variant, Version};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_cbor::{de::from_slice, Serializer};
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroize;

use std::convert::TryInto;

/// Label mixed into the MAC key to derive the manifest authentication subkey
const TAM_SUBKEY_LABEL: &[u8] = b"manifest-tam";

/// Error describing things that can go wrong with key handling
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Encrypted key encryption/decryption failed")]
    EncryptionError(#[from] super::EncryptionError),
    #[error("Something went wrong with argon2")]
    Argon2Error(#[from] argon2::Error),
    #[error("Something went wrong with Serialization/Deserialization")]
    DecodeError(#[from] serde_cbor::error::Error),
}

type Result<T> = std::result::Result<T, KeyError>;

/// Stores the key material used by a cairn repository.
///
/// - `key`: the key used for encryption/decryption operations
/// - `hmac_key`: the key used for generating integrity MAC tags
/// - `id_key`: the key used for chunk id generation
/// - `id_seed`: 32 bytes XORed into every chunk id, so identical plain text
///   in different repositories yields different ids
/// - `chunker_nonce`: a random `u64` used to randomize the content-defined
///   chunker's lookup table
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Zeroize)]
#[zeroize(drop)]
pub struct Key {
    key: Vec<u8>,
    hmac_key: Vec<u8>,
    id_key: Vec<u8>,
    id_seed: Vec<u8>,
    chunker_nonce: u64,
}

impl Key {
    /// Securely generates a random bundle of key material.
    ///
    /// Takes the desired length in bytes of the encryption, MAC, and id
    /// keys. The id seed is always 32 bytes.
    #[tracing::instrument(level = "trace")]
    pub fn random(length: usize) -> Key {
        let mut buffer1 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer1);
        let mut buffer2 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer2);
        let mut buffer3 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer3);
        let mut seed = vec![0; 32];
        thread_rng().fill_bytes(&mut seed);
        trace!("Generated a random key");
        Key {
            key: buffer1,
            hmac_key: buffer2,
            id_key: buffer3,
            id_seed: seed,
            chunker_nonce: thread_rng().next_u64(),
        }
    }

    /// Key material for unencrypted repositories: all-zero keys, reducing
    /// chunk ids to an unkeyed hash of the plain text
    pub fn blank() -> Key {
        Key {
            key: vec![0; 32],
            hmac_key: vec![0; 32],
            id_key: vec![0; 32],
            id_seed: vec![0; 32],
            chunker_nonce: 0,
        }
    }

    /// Obtains a reference to the encryption key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Obtains a reference to the MAC key bytes
    pub fn hmac_key(&self) -> &[u8] {
        &self.hmac_key
    }

    /// Obtains a reference to the id key bytes
    pub fn id_key(&self) -> &[u8] {
        &self.id_key
    }

    /// Obtains a reference to the id seed bytes
    pub fn id_seed(&self) -> &[u8] {
        &self.id_seed
    }

    /// Obtains the chunker nonce
    pub fn chunker_nonce(&self) -> u64 {
        self.chunker_nonce
    }

    /// Derives the subkey used for manifest authentication (TAM).
    ///
    /// A keyed hash of a fixed label under the MAC key, so a manifest MAC
    /// can never be confused with an object MAC.
    pub fn tam_subkey(&self) -> Vec<u8> {
        HMAC::Blake2b.mac_with_key(TAM_SUBKEY_LABEL, &self.hmac_key)
    }
}

/// Stores the key, encrypted with another key derived from the user supplied
/// passphrase.
///
/// Uses argon2id to derive the key encryption key, with a randomly generated
/// 32 byte salt.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EncryptedKey {
    encrypted_bytes: Vec<u8>,
    salt: [u8; 32],
    mem_cost: u32,
    time_cost: u32,
    encryption: Encryption,
}

impl EncryptedKey {
    /// Produces an encrypted key from the specified user passphrase and
    /// encryption method
    #[tracing::instrument(level = "trace", skip(key, user_key))]
    pub fn encrypt(
        key: &Key,
        mem_cost: u32,
        time_cost: u32,
        encryption: Encryption,
        user_key: &[u8],
    ) -> EncryptedKey {
        // Serialize the key. Since we are serializing into a Vec<u8> and Key
        // contains no types that can fail to serialize, this unwrap is
        // infallible.
        let mut key_buffer = Vec::<u8>::new();
        key.serialize(&mut Serializer::new(&mut key_buffer)).unwrap();
        // Generate a salt
        let mut salt = [0; 32];
        thread_rng().fill_bytes(&mut salt);
        // Derive the key encryption key from the user passphrase
        let config = Config {
            variant: Variant::Argon2id,
            version: Version::Version13,
            mem_cost,
            time_cost,
            thread_mode: ThreadMode::Sequential,
            lanes: 1,
            secret: &[],
            ad: &[],
            hash_length: encryption
                .key_length()
                .try_into()
                .expect("Key length was too large (larger than u32)"),
        };

        let generated_key_bytes = argon2::hash_raw(user_key, &salt, &config)
            .expect("Unable to hash passphrase with argon2, most likely due to invalid settings");
        let encrypted_bytes = encryption.encrypt_bytes(&key_buffer, &generated_key_bytes);
        trace!("Encrypted key");
        EncryptedKey {
            encrypted_bytes,
            salt,
            mem_cost,
            time_cost,
            encryption,
        }
    }

    /// Convenience function using argon2 parameters that are reasonable at
    /// time of writing:
    ///
    /// - `mem_cost`: 65536
    /// - `time_cost`: 10
    #[tracing::instrument(level = "trace", skip(key, user_key))]
    pub fn encrypt_defaults(key: &Key, encryption: Encryption, user_key: &[u8]) -> EncryptedKey {
        EncryptedKey::encrypt(key, 65536, 10, encryption, user_key)
    }

    /// Attempts to decrypt the key material using the user supplied
    /// passphrase.
    ///
    /// # Errors
    ///
    /// Will return `Err(KeyError)` if key decryption fails, including when
    /// the passphrase is simply wrong.
    pub fn decrypt(&self, user_key: &[u8]) -> Result<Key> {
        // Derive the key encryption key from the user passphrase
        let config = Config {
            variant: Variant::Argon2id,
            version: Version::Version13,
            mem_cost: self.mem_cost,
            time_cost: self.time_cost,
            thread_mode: ThreadMode::Sequential,
            lanes: 1,
            secret: &[],
            ad: &[],
            hash_length: self
                .encryption
                .key_length()
                .try_into()
                .expect("Key length was too large (larger than u32)"),
        };
        let generated_key_bytes = argon2::hash_raw(user_key, &self.salt, &config)?;
        // Decrypt the key
        let key_bytes = self
            .encryption
            .decrypt_bytes(&self.encrypted_bytes, &generated_key_bytes)?;
        // Deserialize the key; a wrong passphrase surfaces here as garbage
        // bytes failing to parse
        let key = from_slice(&key_bytes[..])?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let input_key = Key::random(32);
        let user_key = "A secure passphrase".as_bytes();
        let encryption = Encryption::new_aes256ctr();
        let enc_key = EncryptedKey::encrypt(&input_key, 1024, 2, encryption, user_key);
        let output_key = enc_key.decrypt(user_key).unwrap();

        assert_eq!(input_key, output_key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let input_key = Key::random(32);
        let encryption = Encryption::new_chacha20();
        let enc_key = EncryptedKey::encrypt(&input_key, 1024, 2, encryption, b"right");
        assert!(enc_key.decrypt(b"wrong").is_err());
    }

    #[test]
    fn tam_subkey_is_stable_and_distinct() {
        let key = Key::random(32);
        assert_eq!(key.tam_subkey(), key.tam_subkey());
        assert_ne!(key.tam_subkey(), key.hmac_key().to_vec());
    }
}
