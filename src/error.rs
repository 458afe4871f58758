#![forbid(unsafe_code)]

use std::io;

////////////////////////////////////////////////////////////////////////////////

/// Every way a compression or decompression call can fail.
///
/// All variants are fatal for the call that produced them: the stream is
/// either malformed or incomplete, and retrying will not change that.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Container framing is wrong (magic, method, reserved flags).
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A code length table does not describe a valid prefix code.
    #[error("malformed huffman table: {0}")]
    MalformedHuffmanTable(&'static str),

    /// A DEFLATE block violates RFC 1951.
    #[error("malformed block: {0}")]
    MalformedBlock(&'static str),

    /// A checksum or length stored in the stream does not match the data.
    #[error("{what} check failed: expected {expected:#010x}, got {actual:#010x}")]
    Integrity {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    /// The input ended before the logical stream did.
    #[error("unexpected end of input")]
    TruncatedInput,

    /// Options passed to a codec are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::TruncatedInput,
            _ => Error::Io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::TruncatedInput => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl Error {
    /// True for errors caused by the content of the stream rather than by I/O.
    pub fn is_data_error(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::InvalidConfig(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////
