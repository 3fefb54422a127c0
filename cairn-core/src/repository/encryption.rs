/*!
Selectable encryption modes for objects.

Objects are protected encrypt-then-MAC: a stream cipher (AES256-CTR or
ChaCha20) is applied here, and the keyed MAC over the resulting cipher text
lives in the chunk envelope. The nonce for each object is embedded in the
mode tag; repository writers derive nonces from a persistent monotonic
counter, while key wrapping uses one-shot random nonces.
*/

// In this case, this lint results in harder to read code for security critical portions
#![allow(clippy::match_same_arms)]

mod aes_shim;

use chacha20::ChaCha20;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use stream_cipher::generic_array::GenericArray;
use stream_cipher::{NewStreamCipher, SyncStreamCipher};
use thiserror::Error;
use zeroize::Zeroize;

use crate::repository::Key;

use std::cmp;
use std::convert::TryInto;

/// Error describing things that can go wrong with encryption/decryption
#[derive(Error, Debug)]
#[allow(clippy::empty_enum)]
pub enum EncryptionError {}

type Result<T> = std::result::Result<T, EncryptionError>;

/// Tag for the encryption algorithm and nonce used by a particular object
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum Encryption {
    NoEncryption,
    AES256CTR { nonce: [u8; 16] },
    ChaCha20 { nonce: [u8; 12] },
}

impl Encryption {
    /// Creates an `AES256CTR` tag from a counter value.
    ///
    /// The counter occupies the first eight bytes of the initial counter
    /// block; the remainder is zero and is consumed by the block counter.
    pub fn aes256ctr(counter: u64) -> Encryption {
        let mut nonce = [0_u8; 16];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Encryption::AES256CTR { nonce }
    }

    /// Creates a `ChaCha20` tag from a counter value
    pub fn chacha20(counter: u64) -> Encryption {
        let mut nonce = [0_u8; 12];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        Encryption::ChaCha20 { nonce }
    }

    /// Creates a new `AES256CTR` tag with a random nonce.
    ///
    /// Only used for key wrapping, where the key encryption key is itself
    /// freshly derived from a random salt.
    pub fn new_aes256ctr() -> Encryption {
        let mut nonce = [0_u8; 16];
        thread_rng().fill_bytes(&mut nonce);
        Encryption::AES256CTR { nonce }
    }

    /// Creates a new `ChaCha20` tag with a random nonce, for key wrapping
    pub fn new_chacha20() -> Encryption {
        let mut nonce = [0_u8; 12];
        thread_rng().fill_bytes(&mut nonce);
        Encryption::ChaCha20 { nonce }
    }

    /// Produces a tag with the same algorithm, but carrying the given
    /// counter value as its nonce
    pub fn with_counter(self, counter: u64) -> Encryption {
        match self {
            Encryption::NoEncryption => Encryption::NoEncryption,
            Encryption::AES256CTR { .. } => Encryption::aes256ctr(counter),
            Encryption::ChaCha20 { .. } => Encryption::chacha20(counter),
        }
    }

    /// Recovers the counter value this tag's nonce was derived from.
    ///
    /// Returns `None` for `NoEncryption`. Used on open to advance the
    /// persistent nonce counter past everything observed in the repository.
    pub fn counter(&self) -> Option<u64> {
        match self {
            Encryption::NoEncryption => None,
            Encryption::AES256CTR { nonce } => {
                Some(u64::from_le_bytes(nonce[..8].try_into().unwrap()))
            }
            Encryption::ChaCha20 { nonce } => {
                Some(u64::from_le_bytes(nonce[..8].try_into().unwrap()))
            }
        }
    }

    /// Returns the key length of this encryption method in bytes.
    ///
    /// `NoEncryption` reports 16 bytes, as key wrapping relies on a non-zero
    /// key length.
    pub fn key_length(&self) -> usize {
        match self {
            Encryption::NoEncryption => 16,
            Encryption::AES256CTR { .. } => 32,
            Encryption::ChaCha20 { .. } => 32,
        }
    }

    /// Encrypts a bytestring using the algorithm in the tag and the
    /// repository's encryption key
    pub fn encrypt(&self, data: &[u8], key: &Key) -> Vec<u8> {
        self.encrypt_bytes(data, key.key())
    }

    /// Internal method that does the actual encryption, please use the
    /// `encrypt` method to avoid key confusion
    pub fn encrypt_bytes(&self, data: &[u8], key: &[u8]) -> Vec<u8> {
        match self {
            Encryption::NoEncryption => data.to_vec(),
            Encryption::AES256CTR { nonce } => aes_shim::aes_256_ctr(data, key, &nonce[..]),
            Encryption::ChaCha20 { nonce } => {
                let mut proper_key: [u8; 32] = [0; 32];
                proper_key[..cmp::min(key.len(), 32)]
                    .clone_from_slice(&key[..cmp::min(key.len(), 32)]);
                let cipher_key = GenericArray::from_slice(&proper_key);
                let nonce = GenericArray::from_slice(&nonce[..]);
                let mut encryptor = ChaCha20::new(cipher_key, nonce);
                let mut final_result = data.to_vec();
                encryptor.apply_keystream(&mut final_result);

                proper_key.zeroize();
                final_result
            }
        }
    }

    /// Decrypts a bytestring with the repository's encryption key.
    ///
    /// Stream ciphers cannot themselves detect tampering; callers verify the
    /// envelope MAC before calling this.
    pub fn decrypt(&self, data: &[u8], key: &Key) -> Result<Vec<u8>> {
        self.decrypt_bytes(data, key.key())
    }

    pub fn decrypt_bytes(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        // CTR-family ciphers are their own inverse
        Ok(self.encrypt_bytes(data, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str;

    fn test_encryption(enc: Encryption) {
        let mut key: [u8; 32] = [0; 32];
        thread_rng().fill_bytes(&mut key);

        let data_string =
            "The quick brown fox jumps over the lazy dog. Jackdaws love my big sphinx of quartz.";
        let encrypted = enc.encrypt_bytes(data_string.as_bytes(), &key);
        let decrypted_bytes = enc.decrypt_bytes(&encrypted, &key).unwrap();
        let decrypted_string = str::from_utf8(&decrypted_bytes).unwrap();

        assert_eq!(data_string, decrypted_string);
    }

    #[test]
    fn chacha20_round_trip() {
        test_encryption(Encryption::chacha20(42));
    }

    #[test]
    fn aes256ctr_round_trip() {
        test_encryption(Encryption::aes256ctr(42));
    }

    #[test]
    fn counter_survives_the_nonce() {
        assert_eq!(Encryption::aes256ctr(77).counter(), Some(77));
        assert_eq!(Encryption::chacha20(u64::max_value()).counter(), Some(u64::max_value()));
        assert_eq!(Encryption::NoEncryption.counter(), None);
    }

    #[test]
    fn distinct_counters_give_distinct_cipher_text() {
        let key = [7_u8; 32];
        let data = [0_u8; 64];
        let a = Encryption::chacha20(1).encrypt_bytes(&data, &key);
        let b = Encryption::chacha20(2).encrypt_bytes(&data, &key);
        assert_ne!(a, b);
    }
}
