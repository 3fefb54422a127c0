/*!
API for describing types that can slice data into component chunks in a
repeatable manner.

Chunkers must meet three properties:

1. Data must be split into one or more chunks
2. Data must be identical to the original after simple reconstruction by
   concatenation
3. The same data and settings must produce the same cut sequence every
   time, independent of how the input was buffered

The rolling-hash splitter here is not cryptographic; its sole purpose is
boundary selection.
*/

pub mod buzhash;
pub mod static_size;

pub use self::buzhash::BuzHash;
pub use self::static_size::StaticSize;

use thiserror::Error;

use std::io;
use std::io::{Cursor, Read};

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Provider IO error")]
    IOError(#[from] io::Error),
    #[error("Internal Chunker Error")]
    InternalError(String),
    #[error("Slicer incorrectly applied to empty data")]
    Empty,
}

/// Describes something that can slice objects in a defined, repeatable
/// manner.
///
/// Chunkers should contain only a small number of settings, and should
/// therefore be cloneable with minimal overhead.
pub trait Chunker: Clone {
    type Chunks: Iterator<Item = Result<Vec<u8>, ChunkerError>>;
    /// Core function, takes a boxed owned `Read` and produces an iterator of
    /// chunks over it
    fn chunk_boxed(&self, read: Box<dyn Read + Send + 'static>) -> Self::Chunks;
    /// Convenience function that boxes a bare `Read` for you, and passes it
    /// to `chunk_boxed`.
    ///
    /// This will be the primary source of interaction with the API for most
    /// use cases.
    fn chunk<R: Read + Send + 'static>(&self, read: R) -> Self::Chunks {
        let boxed: Box<dyn Read + Send + 'static> = Box::new(read);
        self.chunk_boxed(boxed)
    }
    /// Convenience function that wraps an `AsRef<[u8]>` in a cursor and
    /// passes it to `chunk_boxed`
    fn chunk_slice<R: AsRef<[u8]> + Send + 'static>(&self, slice: R) -> Self::Chunks {
        let cursor = Cursor::new(slice);
        let boxed: Box<dyn Read + Send + 'static> = Box::new(cursor);
        self.chunk_boxed(boxed)
    }
}
