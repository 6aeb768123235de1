//! Error type shared by the bundle and class database code.

use std::io;

/// Error produced while reading or writing bundle and class database files.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The file does not start with the "UnityFS" signature.
    #[error("unsupported bundle signature: {0}")]
    UnsupportedSignature(String),

    /// The bundle format version is outside the supported 6..=8 range.
    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u32),

    /// A compression type this library cannot decode or encode.
    #[error("unsupported compression type: {0}")]
    UnsupportedCompression(u32),

    /// Short read, bad length prefix, inconsistent sizes, or a string
    /// missing its terminator.
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),

    /// The LZ4/LZMA adapter rejected its input or produced fewer bytes
    /// than declared.
    #[error("codec error: {0}")]
    Codec(&'static str),

    /// `write` or `pack` was called while the data region is still
    /// compressed; the bundle must be unpacked first.
    #[error("bundle data must be decompressed first")]
    MustDecompressFirst,

    /// An operation that needs the header ran before `read`.
    #[error("bundle header is not loaded")]
    HeaderNotLoaded,

    /// A directory index outside the directory list.
    #[error("directory index {0} is out of range")]
    IndexOutOfRange(usize),

    /// A read was attempted after `close`.
    #[error("stream is closed")]
    ClosedStream,

    /// A feature the library knowingly rejects, such as encrypted bundles.
    #[error("{0}")]
    Unsupported(&'static str),

    /// An underlying stream failure, passed through.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
