//! Reading, rewriting, packing and unpacking of Unity `UnityFS` asset
//! bundle containers, plus the companion class database file used to
//! interpret asset type metadata.
//!
//! A bundle is a layered container: a big-endian header, a block/directory
//! listing (itself optionally compressed), and a data region made of one or
//! more compressed blocks holding slices of the embedded files. This crate
//! parses that structure, exposes the logical decompressed data region as a
//! seekable stream (random access even over LZ4-compressed blocks), and
//! re-emits valid bundles after entries have been replaced or removed.
//!
//! Asset payloads themselves are out of scope; directory entries are read
//! and written as opaque byte ranges.

use std::io::{Read, Seek, Write};

pub mod binary;
pub mod block_stream;
pub mod bundle;
pub mod class_database;
pub mod codec;
mod error;
pub mod segment;

pub use error::{Error, Result};

/// Seekable byte source. Blanket-implemented for anything `Read + Seek`.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Seekable byte sink. Blanket-implemented for anything `Write + Seek`.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek + ?Sized> WriteSeek for T {}
