#![forbid(unsafe_code)]

use std::io::{BufRead, Read, Write};

pub mod bit_reader;
pub mod bit_writer;
pub mod deflate;
pub mod encoder;
pub mod error;
pub mod gzip;
pub mod huffman;
pub mod sliding_window;
pub mod tracking_writer;
pub mod zlib;

pub use crate::deflate::Deflate;
pub use crate::encoder::CompressionLevel;
pub use crate::error::{Error, Result};
pub use crate::gzip::Gzip;
pub use crate::zlib::Zlib;

////////////////////////////////////////////////////////////////////////////////

/// A codec that can turn a byte stream into its compressed form and back.
///
/// Both directions return the number of uncompressed bytes processed.
pub trait CompressionMethod {
    fn name(&self) -> &'static str;

    fn uncompress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64>;

    fn compress<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64>;

    fn uncompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.uncompress(data, &mut out)?;
        Ok(out)
    }

    fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.compress(data, &mut out)?;
        Ok(out)
    }
}

/// Decompress a (possibly multi-member) GZIP stream with default settings.
pub fn decompress<R: BufRead, W: Write>(input: R, output: W) -> Result<()> {
    Gzip::default().uncompress(input, output)?;
    Ok(())
}
