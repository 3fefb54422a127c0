/*!
Selectable compression codecs for objects.

Every stored payload begins with a single codec tag byte, and that byte is
authoritative: mixing codecs within one repository is supported, and the
decoder never consults repository settings to pick an algorithm. Two
pseudo-codecs wrap the real ones: `Auto` probes LZ4 and falls back to
storing the plain text when the data does not compress, and `Obfuscate`
pads the compressed payload with random bytes to hide its true size.
*/
use flate2::write::ZlibEncoder;
use lz4::{Decoder, EncoderBuilder};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xz2::read::{XzDecoder, XzEncoder};

use std::convert::TryInto;
use std::io::{copy, Cursor, Read, Write};

/// Codec tag bytes, stored as the first byte of every compressed payload.
const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;
const TAG_ZLIB: u8 = 0x03;
const TAG_LZMA: u8 = 0x04;
const TAG_OBFUSCATED: u8 = 0x06;

/// Storing the plain text beats storing LZ4 output unless the output is at
/// least this many 1/32nds smaller than the input.
const AUTO_MARGIN_32NDS: usize = 1;

/// Error describing the ways decompression and spec parsing can fail
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("I/O error during (de)compression")]
    IOError(#[from] std::io::Error),
    #[error("Payload carries unknown codec tag {0:#04x}")]
    UnknownTag(u8),
    #[error("Payload is truncated")]
    Truncated,
    #[error("Unrecognized compression spec: {0}")]
    InvalidSpec(String),
}

type Result<T> = std::result::Result<T, CompressionError>;

/// A concrete compression codec, without the wrapping pseudo-codecs
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Codec {
    NoCompression,
    LZ4 { level: u32 },
    ZStd { level: i32 },
    Zlib { level: u32 },
    LZMA { level: u32 },
}

impl Codec {
    /// Compresses `data`, prefixing the output with this codec's tag byte.
    ///
    /// # Panics
    ///
    /// Will panic if the codec itself fails. The codecs only fail on invalid
    /// internal state, which the caller has no way to recover from.
    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Codec::NoCompression => {
                let mut output = Vec::with_capacity(data.len() + 1);
                output.push(TAG_NONE);
                output.extend_from_slice(data);
                output
            }
            Codec::LZ4 { level } => {
                let mut output = vec![TAG_LZ4];
                let mut encoder = EncoderBuilder::new()
                    .level(level)
                    .build(&mut output)
                    .expect("Constructing an LZ4 encoder failed");
                copy(&mut Cursor::new(data), &mut encoder).expect("LZ4 compression failed");
                let (_, result) = encoder.finish();
                result.expect("LZ4 compression failed");
                output
            }
            Codec::ZStd { level } => {
                let mut output = vec![TAG_ZSTD];
                zstd::stream::copy_encode(data, &mut output, level)
                    .expect("ZStd compression failed");
                output
            }
            Codec::Zlib { level } => {
                let mut output = vec![TAG_ZLIB];
                let mut encoder = ZlibEncoder::new(&mut output, flate2::Compression::new(level));
                encoder.write_all(data).expect("Zlib compression failed");
                encoder.finish().expect("Zlib compression failed");
                output
            }
            Codec::LZMA { level } => {
                let mut output = vec![TAG_LZMA];
                let mut encoder = XzEncoder::new(Cursor::new(data), level);
                encoder
                    .read_to_end(&mut output)
                    .expect("LZMA compression failed");
                output
            }
        }
    }

    /// The tag byte this codec stores
    pub fn tag(self) -> u8 {
        match self {
            Codec::NoCompression => TAG_NONE,
            Codec::LZ4 { .. } => TAG_LZ4,
            Codec::ZStd { .. } => TAG_ZSTD,
            Codec::Zlib { .. } => TAG_ZLIB,
            Codec::LZMA { .. } => TAG_LZMA,
        }
    }
}

/// Selects how much random padding `Obfuscate` appends.
///
/// The exact distributions are deliberately simple and documented here
/// rather than matching any particular other implementation bit-for-bit:
///
/// - `Relative { level }` (spec levels 1 through 6) draws a uniformly random
///   pad of up to `len >> (level - 1)` bytes, so level 1 pads by up to 100%
///   of the payload and level 6 by up to ~3%.
/// - `Absolute { level }` (spec levels 110 through 123) rounds the payload
///   up to the next multiple of `1 KiB << (level - 110)`.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum PaddingSpec {
    Relative { level: u32 },
    Absolute { level: u32 },
}

impl PaddingSpec {
    /// Maps a numeric obfuscation spec to a padding distribution
    pub fn from_level(level: u32) -> Result<PaddingSpec> {
        match level {
            1..=6 => Ok(PaddingSpec::Relative { level }),
            110..=123 => Ok(PaddingSpec::Absolute { level }),
            _ => Err(CompressionError::InvalidSpec(format!(
                "obfuscation level {} is outside 1..=6 and 110..=123",
                level
            ))),
        }
    }

    /// Number of padding bytes to append to a payload of length `len`
    fn padding_for(self, len: usize) -> usize {
        match self {
            PaddingSpec::Relative { level } => {
                let max_pad = len >> (level - 1).min(63);
                if max_pad == 0 {
                    0
                } else {
                    thread_rng().gen_range(0, max_pad + 1)
                }
            }
            PaddingSpec::Absolute { level } => {
                let block = 1024_usize << (level - 110).min(63);
                (block - (len % block)) % block
            }
        }
    }
}

/// Compression selection for new objects.
///
/// `Exact` always stores with the named codec; `Auto` probes LZ4 and keeps
/// the plain text when compression does not pay for itself; `Obfuscate`
/// compresses with `inner` and then pads the result.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Compression {
    Exact(Codec),
    Auto,
    Obfuscate { padding: PaddingSpec, inner: Codec },
}

impl Compression {
    /// Compresses the data, producing a tagged payload.
    ///
    /// # Panics
    ///
    /// Will panic if the underlying codec fails, see [`Codec::compress`].
    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Compression::Exact(codec) => codec.compress(data),
            Compression::Auto => {
                let compressed = Codec::LZ4 { level: 1 }.compress(data);
                if compressed.len() + data.len() / 32 * AUTO_MARGIN_32NDS < data.len() {
                    compressed
                } else {
                    Codec::NoCompression.compress(data)
                }
            }
            Compression::Obfuscate { padding, inner } => {
                let compressed = inner.compress(data);
                let pad = padding.padding_for(compressed.len());
                let mut output = Vec::with_capacity(compressed.len() + pad + 5);
                output.push(TAG_OBFUSCATED);
                let inner_len: u32 = compressed
                    .len()
                    .try_into()
                    .expect("Compressed payload exceeds 4 GiB");
                output.extend_from_slice(&inner_len.to_le_bytes());
                output.extend_from_slice(&compressed);
                let mut pad_bytes = vec![0_u8; pad];
                thread_rng().fill_bytes(&mut pad_bytes);
                output.extend_from_slice(&pad_bytes);
                output
            }
        }
    }

    /// Decompresses a tagged payload.
    ///
    /// Dispatches on the payload's own tag byte; the repository's configured
    /// compression plays no part in decoding.
    ///
    /// # Errors
    ///
    /// Returns `Err(UnknownTag)` for an unrecognized tag byte, and
    /// `Err(Truncated)` or `Err(IOError)` for corrupt payloads.
    pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        let (&tag, body) = data.split_first().ok_or(CompressionError::Truncated)?;
        match tag {
            TAG_NONE => Ok(body.to_vec()),
            TAG_LZ4 => {
                let mut output = Vec::new();
                let mut decoder = Decoder::new(Cursor::new(body))?;
                copy(&mut decoder, &mut output)?;
                let (_, result) = decoder.finish();
                result?;
                Ok(output)
            }
            TAG_ZSTD => {
                let mut output = Vec::new();
                zstd::stream::copy_decode(body, &mut output)?;
                Ok(output)
            }
            TAG_ZLIB => {
                let mut output = Vec::new();
                let mut decoder = flate2::read::ZlibDecoder::new(body);
                decoder.read_to_end(&mut output)?;
                Ok(output)
            }
            TAG_LZMA => {
                let mut output = Vec::new();
                let mut decoder = XzDecoder::new(Cursor::new(body));
                decoder.read_to_end(&mut output)?;
                Ok(output)
            }
            TAG_OBFUSCATED => {
                if body.len() < 4 {
                    return Err(CompressionError::Truncated);
                }
                let (len_bytes, rest) = body.split_at(4);
                let inner_len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                let inner = rest.get(..inner_len).ok_or(CompressionError::Truncated)?;
                Compression::decompress(inner)
            }
            unknown => Err(CompressionError::UnknownTag(unknown)),
        }
    }

    /// Parses a user-facing compression spec.
    ///
    /// Recognized forms: `none`, `lz4[,L]`, `zstd[,L]`, `zlib[,L]`,
    /// `lzma[,L]`, `auto[,lz4]`, and `obfuscate,SPEC,INNER[,L]`.
    pub fn parse(spec: &str) -> Result<Compression> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        let invalid = || CompressionError::InvalidSpec(spec.to_string());
        match parts[0] {
            "auto" => match parts.len() {
                1 => Ok(Compression::Auto),
                2 if parts[1] == "lz4" => Ok(Compression::Auto),
                _ => Err(invalid()),
            },
            "obfuscate" => {
                if parts.len() < 3 {
                    return Err(invalid());
                }
                let level: u32 = parts[1].parse().map_err(|_| invalid())?;
                let padding = PaddingSpec::from_level(level)?;
                let inner = match Compression::parse(&parts[2..].join(","))? {
                    Compression::Exact(codec) => codec,
                    // Nesting wrappers inside obfuscate is not meaningful
                    _ => return Err(invalid()),
                };
                Ok(Compression::Obfuscate { padding, inner })
            }
            _ => Self::parse_codec(&parts).map(Compression::Exact),
        }
    }

    fn parse_codec(parts: &[&str]) -> Result<Codec> {
        let spec = parts.join(",");
        let invalid = || CompressionError::InvalidSpec(spec.clone());
        let level = |default: u32| -> Result<u32> {
            match parts.len() {
                1 => Ok(default),
                2 => parts[1].parse().map_err(|_| invalid()),
                _ => Err(invalid()),
            }
        };
        match parts[0] {
            "none" => {
                if parts.len() == 1 {
                    Ok(Codec::NoCompression)
                } else {
                    Err(invalid())
                }
            }
            "lz4" => Ok(Codec::LZ4 { level: level(1)? }),
            "zstd" => Ok(Codec::ZStd {
                level: level(3)? as i32,
            }),
            "zlib" => Ok(Codec::Zlib { level: level(6)? }),
            "lzma" => Ok(Codec::LZMA { level: level(6)? }),
            _ => Err(invalid()),
        }
    }
}

impl Default for Compression {
    fn default() -> Compression {
        Compression::Auto
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn round_trip_with(compression: Compression) {
        let data_string =
            "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor \
             incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
             exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.";
        let data = data_string.as_bytes();
        let compressed = compression.compress(data);
        let decompressed = Compression::decompress(&compressed).unwrap();
        assert_eq!(data.to_vec(), decompressed);
    }

    #[test]
    fn all_codecs() {
        let compressions = [
            Compression::Exact(Codec::NoCompression),
            Compression::Exact(Codec::LZ4 { level: 1 }),
            Compression::Exact(Codec::ZStd { level: 1 }),
            Compression::Exact(Codec::Zlib { level: 6 }),
            Compression::Exact(Codec::LZMA { level: 1 }),
            Compression::Auto,
            Compression::Obfuscate {
                padding: PaddingSpec::Relative { level: 1 },
                inner: Codec::LZ4 { level: 1 },
            },
            Compression::Obfuscate {
                padding: PaddingSpec::Absolute { level: 112 },
                inner: Codec::NoCompression,
            },
        ];
        for c in compressions.iter() {
            round_trip_with(*c);
        }
    }

    #[test]
    fn auto_stores_incompressible_data_plain() {
        let mut data = vec![0_u8; 4096];
        thread_rng().fill_bytes(&mut data);
        let compressed = Compression::Auto.compress(&data);
        assert_eq!(compressed[0], TAG_NONE);
        assert_eq!(&compressed[1..], &data[..]);
    }

    #[test]
    fn auto_compresses_redundant_data() {
        let data = vec![7_u8; 65536];
        let compressed = Compression::Auto.compress(&data);
        assert_eq!(compressed[0], TAG_LZ4);
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn obfuscated_absolute_sizes_are_block_multiples() {
        let padding = PaddingSpec::Absolute { level: 110 };
        for size in &[1_usize, 100, 1023, 1024, 1025, 9000] {
            let data = vec![0x42_u8; *size];
            let compressed = Compression::Obfuscate {
                padding,
                inner: Codec::NoCompression,
            }
            .compress(&data);
            // tag + length prefix, then a 1 KiB-aligned payload
            assert_eq!((compressed.len() - 5) % 1024, 0);
            let decompressed = Compression::decompress(&compressed).unwrap();
            assert_eq!(decompressed, data);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let result = Compression::decompress(&[0x7f, 1, 2, 3]);
        assert!(matches!(result, Err(CompressionError::UnknownTag(0x7f))));
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(
            Compression::parse("none").unwrap(),
            Compression::Exact(Codec::NoCompression)
        );
        assert_eq!(
            Compression::parse("zstd,19").unwrap(),
            Compression::Exact(Codec::ZStd { level: 19 })
        );
        assert_eq!(Compression::parse("auto,lz4").unwrap(), Compression::Auto);
        assert_eq!(
            Compression::parse("obfuscate,3,zstd,6").unwrap(),
            Compression::Obfuscate {
                padding: PaddingSpec::Relative { level: 3 },
                inner: Codec::ZStd { level: 6 },
            }
        );
        assert!(Compression::parse("snappy").is_err());
        assert!(Compression::parse("obfuscate,7,lz4").is_err());
    }

    #[quickcheck]
    fn round_trip_arbitrary(data: Vec<u8>) -> bool {
        let compressed = Compression::Auto.compress(&data);
        Compression::decompress(&compressed).unwrap() == data
    }
}
