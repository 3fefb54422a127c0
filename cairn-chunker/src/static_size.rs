use super::{Chunker, ChunkerError};

use std::io::Read;

/// Settings for a static chunk length `Chunker`.
///
/// Splits the input into `len` sized pieces with no regard for content.
/// Comparatively poor deduplication due to the boundary shift problem, but
/// faster than anything content sensitive; useful for streams that never
/// share content across runs anyway.
#[derive(Clone, Copy)]
pub struct StaticSize {
    pub len: usize,
}

impl Default for StaticSize {
    /// Provides default settings with a chunk size of 64 KiB
    fn default() -> Self {
        StaticSize { len: 65_536 }
    }
}

impl Chunker for StaticSize {
    type Chunks = StaticSizeChunker;
    fn chunk_boxed(&self, read: Box<dyn Read + Send + 'static>) -> Self::Chunks {
        StaticSizeChunker {
            settings: *self,
            internal: read,
            eof: false,
        }
    }
}

pub struct StaticSizeChunker {
    settings: StaticSize,
    internal: Box<dyn Read + Send + 'static>,
    eof: bool,
}

impl Iterator for StaticSizeChunker {
    type Item = Result<Vec<u8>, ChunkerError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.eof {
            return None;
        }
        let mut buffer = vec![0_u8; self.settings.len];
        let mut filled = 0;
        while filled < buffer.len() {
            match self.internal.read(&mut buffer[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(count) => filled += count,
                Err(err) => return Some(Err(err.into())),
            }
        }
        if filled == 0 {
            None
        } else {
            buffer.truncate(filled);
            Some(Ok(buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::io::Cursor;

    // Provides a test slice that does not divide evenly into chunks
    fn get_test_data() -> Vec<u8> {
        let size = StaticSize::default().len * 10 + 10_000;
        let mut vec = vec![0_u8; size];
        rand::thread_rng().fill_bytes(&mut vec);
        vec
    }

    #[test]
    fn reassemble_data() {
        let data = get_test_data();
        let chunks = StaticSize::default()
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let rebuilt: Vec<u8> = chunks.concat();
        assert_eq!(data, rebuilt);
    }

    #[test]
    fn exact_sizes_except_tail() {
        let data = get_test_data();
        let len = StaticSize::default().len;
        let chunks = StaticSize::default()
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let count = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == count - 1 {
                assert!(chunk.len() <= len);
            } else {
                assert_eq!(chunk.len(), len);
            }
        }
    }

    #[test]
    fn identical_chunks() {
        let data = get_test_data();
        let chunks1 = StaticSize::default()
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let chunks2 = StaticSize::default()
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(chunks1, chunks2);
    }
}
