use super::{Chunker, ChunkerError};

use rand::prelude::*;

use std::collections::VecDeque;
use std::io::Read;

/// Settings for a buzhash rolling-hash `Chunker`.
///
/// A cut point is declared wherever the low `mask_bits` bits of the rolling
/// hash over the trailing `window_size` bytes are all zero, subject to the
/// `min_size`/`max_size` bounds. The expected chunk size is therefore about
/// `2^mask_bits` bytes.
///
/// The 256-entry lookup table is derived from a nonce provided by the
/// repository key material, so chunk-size fingerprinting of known plain
/// text requires the key. The final chunk of a stream may be shorter than
/// `min_size`; no chunk ever exceeds `max_size`.
#[derive(Clone, Copy)]
pub struct BuzHash {
    table: [u64; 256],
    window_size: u32,
    mask: u64,
    min_size: usize,
    max_size: usize,
}

impl BuzHash {
    /// Creates a splitter with explicit bounds.
    ///
    /// # Panics
    ///
    /// Panics if `min_size` is zero or `max_size < min_size`; both would
    /// make the cut invariants unsatisfiable.
    pub fn new(
        nonce: u64,
        min_size: usize,
        max_size: usize,
        mask_bits: u32,
        window_size: u32,
    ) -> BuzHash {
        assert!(min_size > 0, "min_size must be non-zero");
        assert!(max_size >= min_size, "max_size must be at least min_size");
        let mut table = [0_u64; 256];
        let mut rand = SmallRng::seed_from_u64(nonce);
        for entry in table.iter_mut() {
            *entry = rand.gen();
        }
        BuzHash {
            table,
            window_size,
            mask: 2_u64.pow(mask_bits) - 1,
            min_size,
            max_size,
        }
    }

    /// Creates a splitter with bounds derived from the mask: cut points are
    /// constrained to `[2^(bits-2), 2^(bits+2)]`, window 4095 bytes
    pub fn with_mask_bits(nonce: u64, mask_bits: u32) -> BuzHash {
        BuzHash::new(
            nonce,
            2_usize.pow(mask_bits - 2),
            2_usize.pow(mask_bits + 2),
            mask_bits,
            4095,
        )
    }

    /// Default settings: 19 mask bits, for an expected chunk size of 512 KiB
    pub fn with_default(nonce: u64) -> BuzHash {
        Self::with_mask_bits(nonce, 19)
    }

    #[cfg(test)]
    fn with_default_testing(nonce: u64) -> BuzHash {
        Self::with_mask_bits(nonce, 14)
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Chunker for BuzHash {
    type Chunks = BuzHashChunker;
    fn chunk_boxed(&self, read: Box<dyn Read + Send + 'static>) -> Self::Chunks {
        BuzHashChunker {
            settings: *self,
            read,
            buffer: VecDeque::new(),
            window: VecDeque::with_capacity(self.window_size as usize),
            hash: 0,
            eof: false,
        }
    }
}

pub struct BuzHashChunker {
    /// Settings for this `Chunker`
    settings: BuzHash,
    /// The reader this `Chunker` is slicing
    read: Box<dyn Read + Send + 'static>,
    /// Bytes read from the reader but not yet emitted in a chunk
    buffer: VecDeque<u8>,
    /// The trailing bytes the rolling hash currently covers
    window: VecDeque<u8>,
    /// The current hash value
    hash: u64,
    eof: bool,
}

impl BuzHashChunker {
    /// Rolls one byte into the hash, evicting the oldest window byte once
    /// the window is full, and returns the new hash value
    fn roll(&mut self, byte: u8) -> u64 {
        let hash = self.hash.rotate_left(1);
        let incoming = self.settings.table[byte as usize];
        if self.window.len() >= self.settings.window_size as usize {
            // This unwrap is fine, the window is known to be non-empty
            let outgoing = self.window.pop_front().unwrap();
            let outgoing = self.settings.table[outgoing as usize]
                .rotate_left(self.settings.window_size);
            self.hash = hash ^ outgoing ^ incoming;
        } else {
            self.hash = hash ^ incoming;
        }
        self.window.push_back(byte);
        self.hash
    }

    /// Reads from the underlying reader until the internal buffer holds at
    /// least `max_size` bytes or the reader is exhausted
    fn fill_buffer(&mut self) -> Result<(), ChunkerError> {
        let goal = self.settings.max_size;
        let mut scratch = [0_u8; 8192];
        while !self.eof && self.buffer.len() < goal {
            let count = self.read.read(&mut scratch)?;
            if count == 0 {
                self.eof = true;
            } else {
                self.buffer.extend(scratch[..count].iter().copied());
            }
        }
        Ok(())
    }

    /// Attempts to produce another chunk from the reader
    fn next_chunk(&mut self) -> Result<Vec<u8>, ChunkerError> {
        // After this, either the buffer holds max_size bytes or we have seen
        // the end of the stream
        self.fill_buffer()?;
        if self.buffer.is_empty() {
            return Err(ChunkerError::Empty);
        }
        // A final fragment below min_size can never be cut, emit it whole
        if self.eof && self.buffer.len() <= self.settings.min_size {
            return Ok(self.buffer.drain(..).collect());
        }
        let mut output = Vec::with_capacity(self.settings.min_size * 2);
        while output.len() < self.settings.max_size && !self.buffer.is_empty() {
            // This unwrap is fine, emptiness is checked in the loop condition
            let byte = self.buffer.pop_front().unwrap();
            output.push(byte);
            let hash = self.roll(byte);
            if hash & self.settings.mask == 0 && output.len() >= self.settings.min_size {
                break;
            }
        }
        Ok(output)
    }
}

impl Iterator for BuzHashChunker {
    type Item = Result<Vec<u8>, ChunkerError>;
    fn next(&mut self) -> Option<Result<Vec<u8>, ChunkerError>> {
        match self.next_chunk() {
            Err(ChunkerError::Empty) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Provides a test slice ten times the testing max size in length
    fn get_test_data() -> Vec<u8> {
        let size = BuzHash::with_default_testing(0).max_size * 10;
        let mut vec = vec![0_u8; size];
        rand::thread_rng().fill_bytes(&mut vec);
        vec
    }

    // Data should be split into one or more chunks.
    //
    // In this case, the data is larger than max_size, so it should be more
    // than one chunk
    #[test]
    fn one_or_more_chunks() {
        let data = get_test_data();
        let cursor = Cursor::new(data);
        let chunker = BuzHash::with_default_testing(0);
        let chunks = chunker.chunk(cursor).map(|x| x.unwrap()).collect::<Vec<_>>();
        assert!(chunks.len() > 1);
    }

    // Data should be identical after reassembly by simple concatenation
    #[test]
    fn reassemble_data() {
        let data = get_test_data();
        let cursor = Cursor::new(data.clone());
        let chunks = BuzHash::with_default_testing(0)
            .chunk(cursor)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let rebuilt: Vec<u8> = chunks.concat();
        assert_eq!(data, rebuilt);
    }

    // Running the chunker over the same data twice should result in
    // identical chunks, regardless of read granularity
    #[test]
    fn identical_chunks() {
        struct OneByteAtATime<R>(R);
        impl<R: Read> Read for OneByteAtATime<R> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if buf.is_empty() {
                    return Ok(0);
                }
                self.0.read(&mut buf[..1])
            }
        }

        let data = get_test_data();
        let chunks1 = BuzHash::with_default_testing(0)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let chunks2 = BuzHash::with_default_testing(0)
            .chunk(OneByteAtATime(Cursor::new(data)))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks1, chunks2);
    }

    // Different table nonces should produce different cut sequences on
    // random data
    #[test]
    fn nonce_changes_cuts() {
        let data = get_test_data();
        let chunks1 = BuzHash::with_default_testing(0)
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap().len())
            .collect::<Vec<_>>();
        let chunks2 = BuzHash::with_default_testing(1)
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap().len())
            .collect::<Vec<_>>();
        assert_ne!(chunks1, chunks2);
    }

    // Verifies that this `Chunker` does not produce chunks larger than its
    // max size
    #[test]
    fn max_size() {
        let data = get_test_data();
        let max_size = BuzHash::with_default_testing(0).max_size;

        let chunks = BuzHash::with_default_testing(0)
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();

        for chunk in chunks {
            assert!(chunk.len() <= max_size);
        }
    }

    // Verifies that this `Chunker`, at most, produces one under-sized chunk,
    // and that it is the final one
    #[test]
    fn min_size() {
        let data = get_test_data();
        let min_size = BuzHash::with_default_testing(0).min_size;

        let chunks = BuzHash::with_default_testing(0)
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();

        let count = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.len() < min_size {
                assert_eq!(i, count - 1);
            }
        }
    }

    // Inputs pinned to the size bounds produce the expected cut counts
    #[test]
    fn boundary_sizes() {
        let chunker = BuzHash::with_default_testing(0);
        let min = chunker.min_size;
        let max = chunker.max_size;

        // Exactly min_size: a single chunk, cut or not
        let chunks = chunker
            .chunk(Cursor::new(vec![0_u8; min]))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), min);

        // Exactly max_size: everything fits in one chunk at most
        let chunks = chunker
            .chunk(Cursor::new(vec![0_u8; max]))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert!(chunks.iter().all(|c| c.len() <= max));
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), max);

        // One byte past max_size forces at least two chunks
        let chunks = chunker
            .chunk(Cursor::new(vec![0_u8; max + 1]))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), max + 1);
    }

    // An empty input yields no chunks at all
    #[test]
    fn empty_input() {
        let chunks = BuzHash::with_default_testing(0)
            .chunk(Cursor::new(Vec::<u8>::new()))
            .count();
        assert_eq!(chunks, 0);
    }

    // A shared suffix, once the chunker has resynchronized, should produce
    // shared chunks even when the prefix differs
    #[test]
    fn shared_content_shares_chunks() {
        let chunker = BuzHash::with_default_testing(0);
        let mut shared = vec![0_u8; chunker.max_size * 6];
        rand::thread_rng().fill_bytes(&mut shared);

        let mut a = vec![1_u8; 3];
        a.extend_from_slice(&shared);
        let mut b = vec![2_u8; 4096];
        b.extend_from_slice(&shared);

        let chunks_a: std::collections::HashSet<Vec<u8>> = chunker
            .chunk(Cursor::new(a))
            .map(|x| x.unwrap())
            .collect();
        let shared_count = chunker
            .chunk(Cursor::new(b))
            .map(|x| x.unwrap())
            .filter(|c| chunks_a.contains(c))
            .count();
        assert!(shared_count > 0);
    }
}
