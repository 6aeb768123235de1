//! UnityFS bundle container: header, block/directory listing, and the
//! read / write / unpack / pack pipelines.

use std::fmt;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::binary::{
    align_reader, align_writer, padding_for_alignment, read_bytes, read_i64_be, read_string_to_null,
    read_u16_be, read_u32_be, write_i64_be, write_string_to_null, write_u16_be, write_u32_be,
};
use crate::block_stream::Lz4BlockStream;
use crate::codec::{self, Lz4Level};
use crate::segment::SegmentStream;
use crate::{Error, ReadSeek, Result, WriteSeek};

pub const SIGNATURE: &str = "UnityFS";

/// Low 6 bits of the header and block flags select the compression type.
pub const COMPRESSION_MASK: u32 = 0x3F;

const FLAG_HAS_DIRECTORY_INFO: u32 = 0x40;
const FLAG_BLOCK_AND_DIR_AT_END: u32 = 0x80;
const FLAG_BLOCK_INFO_NEED_PADDING: u32 = 0x200;
// Bit 0x200 was the encryption marker before the new-flags cutover; the
// padding meaning only exists after it.
const FLAG_ENCRYPTION_OLD: u32 = 0x200;
const FLAG_ENCRYPTION_NEW: u32 = 0x1400;

/// Placeholder flags on block records while the rewriter streams payloads.
const BLOCK_FLAG_STREAMED: u16 = 0x40;

/// Chunk size for LZ4 payload packing.
const LZ4_PACK_CHUNK: usize = 0x0002_0000;

/// Compression selector used by the header, block flags and `pack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lzma = 1,
    Lz4 = 2,
    Lz4Hc = 3,
}

impl CompressionType {
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags & COMPRESSION_MASK {
            0 => Ok(Self::None),
            1 => Ok(Self::Lzma),
            2 => Ok(Self::Lz4),
            3 => Ok(Self::Lz4Hc),
            other => Err(Error::UnsupportedCompression(other)),
        }
    }

    pub fn from_block_flags(flags: u16) -> Result<Self> {
        Self::from_flags(u32::from(flags))
    }
}

/// Opaque 16-byte identifier carried through the listing, never
/// interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash128(pub [u8; 16]);

/// One compressed span of the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub decompressed_size: u32,
    pub compressed_size: u32,
    pub flags: u16,
}

impl BlockInfo {
    pub fn compression_type(&self) -> Result<CompressionType> {
        CompressionType::from_block_flags(self.flags)
    }
}

/// Metadata locating one embedded file inside the logical decompressed
/// data region, plus an optional pending edit.
pub struct DirectoryInfo {
    pub offset: i64,
    pub decompressed_size: i64,
    pub flags: u32,
    pub name: String,
    /// Edit applied by the next `write`: `Remove` drops the entry,
    /// `AddOrModify` substitutes its content.
    pub replacer: Option<Replacer>,
}

impl DirectoryInfo {
    pub fn new(name: impl Into<String>, offset: i64, decompressed_size: i64, flags: u32) -> Self {
        Self {
            offset,
            decompressed_size,
            flags,
            name: name.into(),
            replacer: None,
        }
    }

    /// Copy of the entry metadata without any attached replacer.
    pub fn without_replacer(&self) -> Self {
        Self {
            offset: self.offset,
            decompressed_size: self.decompressed_size,
            flags: self.flags,
            name: self.name.clone(),
            replacer: None,
        }
    }
}

impl fmt::Debug for DirectoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryInfo")
            .field("offset", &self.offset)
            .field("decompressed_size", &self.decompressed_size)
            .field("flags", &self.flags)
            .field("name", &self.name)
            .field("has_replacer", &self.replacer.is_some())
            .finish()
    }
}

impl PartialEq for DirectoryInfo {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
            && self.decompressed_size == other.decompressed_size
            && self.flags == other.flags
            && self.name == other.name
    }
}

/// Caller-supplied content for a directory entry, consumed by `write`.
pub trait ContentReplacer {
    /// Number of bytes `write` will produce.
    fn size(&self) -> u64;
    fn write(&self, writer: &mut dyn WriteSeek) -> Result<()>;
}

/// Edit intent attached to a directory entry.
pub enum Replacer {
    /// Drop the entry on the next write.
    Remove,
    /// Substitute the entry's content.
    AddOrModify(Box<dyn ContentReplacer>),
}

/// Replacer backed by an in-memory buffer.
pub struct BytesReplacer(Vec<u8>);

impl BytesReplacer {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl ContentReplacer for BytesReplacer {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn write(&self, writer: &mut dyn WriteSeek) -> Result<()> {
        writer.write_all(&self.0)?;
        Ok(())
    }
}

/// The block/directory listing of a bundle.
#[derive(Debug)]
pub struct BlockAndDirInfo {
    pub hash: Hash128,
    pub block_infos: Vec<BlockInfo>,
    pub directory_infos: Vec<DirectoryInfo>,
}

impl BlockAndDirInfo {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let bytes = read_bytes(reader, 16)?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&bytes);

        let block_count = read_u32_be(reader)? as usize;
        let mut block_infos = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            block_infos.push(BlockInfo {
                decompressed_size: read_u32_be(reader)?,
                compressed_size: read_u32_be(reader)?,
                flags: read_u16_be(reader)?,
            });
        }

        let directory_count = read_u32_be(reader)? as usize;
        let mut directory_infos = Vec::with_capacity(directory_count);
        for _ in 0..directory_count {
            directory_infos.push(DirectoryInfo {
                offset: read_i64_be(reader)?,
                decompressed_size: read_i64_be(reader)?,
                flags: read_u32_be(reader)?,
                name: read_string_to_null(reader)?,
                replacer: None,
            });
        }

        Ok(Self {
            hash: Hash128(hash),
            block_infos,
            directory_infos,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.hash.0)?;
        write_u32_be(writer, self.block_infos.len() as u32)?;
        for block in &self.block_infos {
            write_u32_be(writer, block.decompressed_size)?;
            write_u32_be(writer, block.compressed_size)?;
            write_u16_be(writer, block.flags)?;
        }
        write_u32_be(writer, self.directory_infos.len() as u32)?;
        for entry in &self.directory_infos {
            write_i64_be(writer, entry.offset)?;
            write_i64_be(writer, entry.decompressed_size)?;
            write_u32_be(writer, entry.flags)?;
            write_string_to_null(writer, &entry.name)?;
        }
        Ok(())
    }

    /// Total decompressed length of the data region.
    pub fn data_len(&self) -> u64 {
        self.block_infos
            .iter()
            .map(|block| u64::from(block.decompressed_size))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsHeader {
    pub total_file_size: i64,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub flags: u32,
}

/// The bundle file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBundleHeader {
    pub signature: String,
    pub version: u32,
    pub generation_version: String,
    pub engine_version: String,
    pub fs: FsHeader,
}

impl AssetBundleHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let signature = read_string_to_null(reader)?;
        if signature != SIGNATURE {
            return Err(Error::UnsupportedSignature(signature));
        }
        let version = read_u32_be(reader)?;
        if !(6..=8).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let generation_version = read_string_to_null(reader)?;
        let engine_version = read_string_to_null(reader)?;
        let fs = FsHeader {
            total_file_size: read_i64_be(reader)?,
            compressed_size: read_u32_be(reader)?,
            decompressed_size: read_u32_be(reader)?,
            flags: read_u32_be(reader)?,
        };
        Ok(Self {
            signature,
            version,
            generation_version,
            engine_version,
            fs,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_string_to_null(writer, &self.signature)?;
        write_u32_be(writer, self.version)?;
        write_string_to_null(writer, &self.generation_version)?;
        write_string_to_null(writer, &self.engine_version)?;
        write_i64_be(writer, self.fs.total_file_size)?;
        write_u32_be(writer, self.fs.compressed_size)?;
        write_u32_be(writer, self.fs.decompressed_size)?;
        write_u32_be(writer, self.fs.flags)?;
        Ok(())
    }

    /// Serialized byte length of the header fields themselves, before any
    /// alignment.
    fn base_size(&self) -> u64 {
        (self.signature.len()
            + 1
            + 4
            + self.generation_version.len()
            + 1
            + self.engine_version.len()
            + 1
            + 8
            + 4
            + 4
            + 4) as u64
    }

    /// Offset of the block/dir listing, relative to the bundle start.
    pub fn bundle_info_offset(&self) -> u64 {
        if self.block_and_dir_at_end() {
            (self.fs.total_file_size as u64).saturating_sub(u64::from(self.fs.compressed_size))
        } else {
            let mut offset = self.base_size();
            if self.version >= 7 {
                offset += padding_for_alignment(offset, 16);
            }
            offset
        }
    }

    /// Offset where the data region begins, relative to the bundle start.
    pub fn file_data_offset(&self) -> u64 {
        let mut offset = self.base_size();
        if self.version >= 7 {
            offset += padding_for_alignment(offset, 16);
        }
        if !self.block_and_dir_at_end() {
            offset += u64::from(self.fs.compressed_size);
        }
        if self.needs_block_info_padding() {
            offset += padding_for_alignment(offset, 16);
        }
        offset
    }

    /// Compression of the listing, from the low 6 flag bits.
    pub fn compression_type(&self) -> Result<CompressionType> {
        CompressionType::from_flags(self.fs.flags)
    }

    pub fn has_directory_info(&self) -> bool {
        self.fs.flags & FLAG_HAS_DIRECTORY_INFO != 0
    }

    pub fn block_and_dir_at_end(&self) -> bool {
        self.fs.flags & FLAG_BLOCK_AND_DIR_AT_END != 0
    }

    pub fn needs_block_info_padding(&self) -> bool {
        self.fs.flags & FLAG_BLOCK_INFO_NEED_PADDING != 0
    }
}

enum DataSource<R> {
    Raw(SegmentStream<R>),
    Lz4(Lz4BlockStream<R>),
}

impl<R: Read + Seek> Read for DataSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(stream) => stream.read(buf),
            Self::Lz4(stream) => stream.read(buf),
        }
    }
}

impl<R: Read + Seek> Seek for DataSource<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Raw(stream) => stream.seek(pos),
            Self::Lz4(stream) => stream.seek(pos),
        }
    }
}

/// An opened UnityFS bundle.
///
/// Constructed empty, populated by [`read`](Self::read). The instance owns
/// its input stream; the data region is exposed through
/// [`data_reader`](Self::data_reader) as a seekable stream of the logical
/// decompressed bytes, except for LZMA bundles where the region stays
/// compressed until [`unpack`](Self::unpack).
pub struct AssetBundleFile<R> {
    header: Option<AssetBundleHeader>,
    block_and_dir: Option<BlockAndDirInfo>,
    data: Option<DataSource<R>>,
    data_is_compressed: bool,
    uses_block_alignment: bool,
}

impl<R: Read + Seek> Default for AssetBundleFile<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read + Seek> AssetBundleFile<R> {
    pub fn new() -> Self {
        Self {
            header: None,
            block_and_dir: None,
            data: None,
            data_is_compressed: false,
            uses_block_alignment: false,
        }
    }

    /// Reads the header and listing and installs the data reader. The
    /// bundle is assumed to start at position 0 of `reader`.
    pub fn read(&mut self, mut reader: R) -> Result<()> {
        reader.seek(SeekFrom::Start(0))?;
        let header = AssetBundleHeader::read(&mut reader)?;
        debug!(
            version = header.version,
            engine = %header.engine_version,
            flags = header.fs.flags,
            "read bundle header"
        );

        let engine = parse_engine_version(&header.engine_version);
        let uses_new_flags = engine.map(uses_new_archive_flags).unwrap_or(false);
        let encryption_flag = if uses_new_flags {
            FLAG_ENCRYPTION_NEW
        } else {
            FLAG_ENCRYPTION_OLD
        };
        if header.fs.flags & encryption_flag != 0 {
            return Err(Error::Unsupported("encrypted asset bundles are not supported"));
        }

        let mut uses_block_alignment = false;
        if header.version >= 7 {
            align_reader(&mut reader, 16)?;
            uses_block_alignment = true;
        } else if engine.map_or(false, |version| version >= (2019, 4, 0)) {
            // 2019.4 bundles align here without bumping the format version;
            // only consume the gap when it really is zero padding.
            let before = reader.stream_position()?;
            let padding = padding_for_alignment(before, 16);
            if padding > 0 {
                let probe = read_bytes(&mut reader, padding as usize)?;
                if probe.iter().all(|byte| *byte == 0) {
                    uses_block_alignment = true;
                } else {
                    reader.seek(SeekFrom::Start(before))?;
                }
            }
        }

        let after_header = reader.stream_position()?;
        let at_end = header.block_and_dir_at_end();
        if at_end {
            reader.seek(SeekFrom::Start(header.bundle_info_offset()))?;
        }

        let listing_compression = header.compression_type()?;
        let block_and_dir = match listing_compression {
            CompressionType::None => BlockAndDirInfo::read(&mut reader)?,
            CompressionType::Lzma | CompressionType::Lz4 | CompressionType::Lz4Hc => {
                let compressed = read_bytes(&mut reader, header.fs.compressed_size as usize)?;
                let decompressed = decompress_listing(
                    &compressed,
                    listing_compression,
                    header.fs.decompressed_size,
                )?;
                BlockAndDirInfo::read(&mut Cursor::new(decompressed))?
            }
        };

        let data_len = block_and_dir.data_len();
        for entry in &block_and_dir.directory_infos {
            if entry.offset < 0
                || entry.decompressed_size < 0
                || (entry.offset as u64).saturating_add(entry.decompressed_size as u64) > data_len
            {
                return Err(Error::MalformedInput(
                    "directory entry extends past the data region",
                ));
            }
        }

        if at_end {
            reader.seek(SeekFrom::Start(after_header))?;
        }
        if header.needs_block_info_padding() {
            align_reader(&mut reader, 16)?;
        }
        let data_offset = reader.stream_position()?;

        let data_compression = classify_data(&block_and_dir.block_infos)?;
        debug!(
            blocks = block_and_dir.block_infos.len(),
            entries = block_and_dir.directory_infos.len(),
            compression = ?data_compression,
            "loaded bundle listing"
        );

        let compressed_len: u64 = block_and_dir
            .block_infos
            .iter()
            .map(|block| u64::from(block.compressed_size))
            .sum();
        let (data, data_is_compressed) = match data_compression {
            CompressionType::None => (
                DataSource::Raw(SegmentStream::new(reader, data_offset, compressed_len)),
                false,
            ),
            // The data is left compressed; only `unpack` streams through
            // LZMA.
            CompressionType::Lzma => (
                DataSource::Raw(SegmentStream::new(reader, data_offset, compressed_len)),
                true,
            ),
            CompressionType::Lz4 | CompressionType::Lz4Hc => (
                DataSource::Lz4(Lz4BlockStream::new(
                    reader,
                    data_offset,
                    block_and_dir.block_infos.clone(),
                )),
                false,
            ),
        };

        self.header = Some(header);
        self.block_and_dir = Some(block_and_dir);
        self.data = Some(data);
        self.data_is_compressed = data_is_compressed;
        self.uses_block_alignment = uses_block_alignment;
        Ok(())
    }

    pub fn header(&self) -> Option<&AssetBundleHeader> {
        self.header.as_ref()
    }

    pub fn block_and_dir_info(&self) -> Option<&BlockAndDirInfo> {
        self.block_and_dir.as_ref()
    }

    pub fn block_and_dir_info_mut(&mut self) -> Option<&mut BlockAndDirInfo> {
        self.block_and_dir.as_mut()
    }

    /// True for LZMA bundles, whose data region stays compressed until
    /// `unpack`.
    pub fn data_is_compressed(&self) -> bool {
        self.data_is_compressed
    }

    pub fn file_count(&self) -> usize {
        self.block_and_dir
            .as_ref()
            .map_or(0, |info| info.directory_infos.len())
    }

    pub fn file_name(&self, index: usize) -> Option<&str> {
        let info = self.block_and_dir.as_ref()?;
        info.directory_infos.get(index).map(|entry| entry.name.as_str())
    }

    /// `(offset, length)` of an entry within the logical decompressed data
    /// region.
    pub fn file_range(&self, index: usize) -> Option<(i64, i64)> {
        let info = self.block_and_dir.as_ref()?;
        info.directory_infos
            .get(index)
            .map(|entry| (entry.offset, entry.decompressed_size))
    }

    pub fn file_index_by_name(&self, name: &str) -> Option<usize> {
        let info = self.block_and_dir.as_ref()?;
        info.directory_infos
            .iter()
            .position(|entry| entry.name == name)
    }

    /// Attaches an edit to a directory entry, consumed by the next `write`.
    pub fn set_replacer(&mut self, index: usize, replacer: Replacer) -> Result<()> {
        let info = self.block_and_dir.as_mut().ok_or(Error::HeaderNotLoaded)?;
        let entry = info
            .directory_infos
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange(index))?;
        entry.replacer = Some(replacer);
        Ok(())
    }

    /// The data region as a seekable stream. For LZMA bundles the bytes
    /// are still compressed (`data_is_compressed`).
    pub fn data_reader(&mut self) -> Result<&mut dyn ReadSeek> {
        if self.header.is_none() {
            return Err(Error::HeaderNotLoaded);
        }
        match self.data.as_mut() {
            Some(DataSource::Raw(stream)) => Ok(stream),
            Some(DataSource::Lz4(stream)) => Ok(stream),
            None => Err(Error::ClosedStream),
        }
    }

    /// Copies one entry's bytes out of the decompressed data region.
    pub fn read_file(&mut self, index: usize) -> Result<Vec<u8>> {
        if self.header.is_none() {
            return Err(Error::HeaderNotLoaded);
        }
        if self.data_is_compressed {
            return Err(Error::MustDecompressFirst);
        }
        let info = self.block_and_dir.as_ref().ok_or(Error::HeaderNotLoaded)?;
        let entry = info
            .directory_infos
            .get(index)
            .ok_or(Error::IndexOutOfRange(index))?;
        let (offset, size) = (entry.offset as u64, entry.decompressed_size as usize);
        let data = self.data.as_mut().ok_or(Error::ClosedStream)?;
        data.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        data.read_exact(&mut buf)
            .map_err(|_| Error::MalformedInput("entry extends past the data region"))?;
        Ok(buf)
    }

    /// Releases the input stream; any later read fails with
    /// [`Error::ClosedStream`].
    pub fn close(&mut self) {
        self.data = None;
    }

    /// Emits an uncompressed bundle reflecting the current directory with
    /// all attached replacers applied.
    ///
    /// The payload is streamed in two passes: the listing is first written
    /// with placeholder sizes, then rewritten once the entry offsets and
    /// block sizes are known. On error the output is left in an undefined
    /// state.
    pub fn write<W: Write + Seek>(&mut self, writer: &mut W) -> Result<()> {
        let header = self.header.as_ref().ok_or(Error::HeaderNotLoaded)?;
        if self.data_is_compressed {
            return Err(Error::MustDecompressFirst);
        }
        let info = self.block_and_dir.as_ref().ok_or(Error::HeaderNotLoaded)?;
        let data = self.data.as_mut().ok_or(Error::ClosedStream)?;

        let start = writer.stream_position()?;
        header.write(writer)?;
        if self.uses_block_alignment {
            align_writer(writer, 16)?;
        }

        // Entry sizes are known up front, which fixes the block count
        // before any payload is streamed.
        let mut total: u64 = 0;
        for entry in &info.directory_infos {
            match &entry.replacer {
                Some(Replacer::Remove) => {}
                Some(Replacer::AddOrModify(content)) => total += content.size(),
                None => total += entry.decompressed_size as u64,
            }
        }
        let block_count = block_count_for(total);

        let kept: Vec<&DirectoryInfo> = info
            .directory_infos
            .iter()
            .filter(|entry| !matches!(entry.replacer, Some(Replacer::Remove)))
            .collect();

        let mut new_info = BlockAndDirInfo {
            hash: info.hash,
            block_infos: (0..block_count)
                .map(|_| BlockInfo {
                    decompressed_size: 0,
                    compressed_size: 0,
                    flags: BLOCK_FLAG_STREAMED,
                })
                .collect(),
            directory_infos: kept.iter().map(|entry| entry.without_replacer()).collect(),
        };

        let listing_pos = writer.stream_position()?;
        new_info.write(writer)?;
        if header.needs_block_info_padding() {
            align_writer(writer, 16)?;
        }
        let asset_data_pos = writer.stream_position()?;

        for (new_entry, old_entry) in new_info.directory_infos.iter_mut().zip(&kept) {
            let entry_start = writer.stream_position()?;
            if let Some(Replacer::AddOrModify(content)) = &old_entry.replacer {
                content.write(writer)?;
            } else {
                data.seek(SeekFrom::Start(old_entry.offset as u64))?;
                copy_exact(data, writer, old_entry.decompressed_size as u64)?;
            }
            new_entry.offset = (entry_start - asset_data_pos) as i64;
            new_entry.decompressed_size = (writer.stream_position()? - entry_start) as i64;
        }

        let end = writer.stream_position()?;
        let asset_size = end - asset_data_pos;
        let mut remaining = asset_size;
        for block in &mut new_info.block_infos {
            let take = remaining.min(u64::from(u32::MAX));
            block.decompressed_size = take as u32;
            block.compressed_size = take as u32;
            remaining -= take;
        }
        debug!(
            entries = new_info.directory_infos.len(),
            blocks = new_info.block_infos.len(),
            asset_size,
            "rewrote bundle"
        );

        writer.seek(SeekFrom::Start(listing_pos))?;
        new_info.write(writer)?;

        let mut new_header = header.clone();
        new_header.fs.total_file_size = (end - start) as i64;
        new_header.fs.compressed_size = (asset_data_pos - listing_pos) as u32;
        new_header.fs.decompressed_size = new_header.fs.compressed_size;
        new_header.fs.flags &= !(COMPRESSION_MASK | FLAG_BLOCK_AND_DIR_AT_END);
        writer.seek(SeekFrom::Start(start))?;
        new_header.write(writer)?;
        writer.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Emits a fully decompressed copy of the bundle.
    pub fn unpack<W: Write + Seek>(&mut self, writer: &mut W) -> Result<()> {
        let header = self.header.as_ref().ok_or(Error::HeaderNotLoaded)?;
        let info = self.block_and_dir.as_ref().ok_or(Error::HeaderNotLoaded)?;
        let data = self.data.as_mut().ok_or(Error::ClosedStream)?;

        let mut new_header = header.clone();
        new_header.fs.flags &= !(COMPRESSION_MASK | FLAG_BLOCK_AND_DIR_AT_END);
        let new_info = BlockAndDirInfo {
            hash: info.hash,
            block_infos: info
                .block_infos
                .iter()
                .map(|block| BlockInfo {
                    decompressed_size: block.decompressed_size,
                    compressed_size: block.decompressed_size,
                    flags: block.flags & !(COMPRESSION_MASK as u16),
                })
                .collect(),
            directory_infos: info
                .directory_infos
                .iter()
                .map(|entry| entry.without_replacer())
                .collect(),
        };

        let mut listing = Cursor::new(Vec::new());
        new_info.write(&mut listing)?;
        let listing_bytes = listing.into_inner();
        new_header.fs.compressed_size = listing_bytes.len() as u32;
        new_header.fs.decompressed_size = listing_bytes.len() as u32;

        let start = writer.stream_position()?;
        new_header.write(writer)?;
        if self.uses_block_alignment {
            align_writer(writer, 16)?;
        }
        writer.write_all(&listing_bytes)?;
        if new_header.needs_block_info_padding() {
            align_writer(writer, 16)?;
        }

        if self.data_is_compressed {
            // LZMA region: decompress block by block off the raw bytes.
            let mut compressed_offset = 0u64;
            for block in &info.block_infos {
                data.seek(SeekFrom::Start(compressed_offset))?;
                match block.compression_type()? {
                    CompressionType::None => {
                        copy_exact(data, writer, u64::from(block.compressed_size))?;
                    }
                    CompressionType::Lzma => {
                        codec::lzma_decompress_stream(
                            data,
                            writer,
                            u64::from(block.decompressed_size),
                            Some(u64::from(block.compressed_size)),
                        )?;
                    }
                    other @ (CompressionType::Lz4 | CompressionType::Lz4Hc) => {
                        return Err(Error::UnsupportedCompression(other as u32));
                    }
                }
                compressed_offset += u64::from(block.compressed_size);
            }
        } else {
            // Raw and LZ4 regions already read back decompressed.
            data.seek(SeekFrom::Start(0))?;
            copy_exact(data, writer, info.data_len())?;
        }

        let end = writer.stream_position()?;
        new_header.fs.total_file_size = (end - start) as i64;
        writer.seek(SeekFrom::Start(start))?;
        new_header.write(writer)?;
        writer.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Emits a compressed bundle. The listing is always LZ4HC-compressed;
    /// the payload is a single raw or LZMA block, or a run of 128 KiB
    /// LZ4HC chunks (falling back to raw bytes chunk by chunk when
    /// compression does not shrink them).
    ///
    /// With `block_dir_at_end` the payload streams straight to the output
    /// and the listing follows it; otherwise the payload is staged in a
    /// delete-on-close temp file so the listing can be written first. The
    /// progress callback, when given, is advisory and reports completed
    /// bytes per block.
    pub fn pack<W: Write + Seek>(
        &mut self,
        writer: &mut W,
        compression: CompressionType,
        block_dir_at_end: bool,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        let header = self.header.as_ref().ok_or(Error::HeaderNotLoaded)?;
        if self.data_is_compressed {
            return Err(Error::MustDecompressFirst);
        }
        let info = self.block_and_dir.as_ref().ok_or(Error::HeaderNotLoaded)?;
        let data = self.data.as_mut().ok_or(Error::ClosedStream)?;

        let data_len = info.data_len();
        debug!(data_len, compression = ?compression, block_dir_at_end, "packing bundle");

        let mut new_header = header.clone();
        new_header.fs.flags = CompressionType::Lz4Hc as u32
            | FLAG_HAS_DIRECTORY_INFO
            | if block_dir_at_end {
                FLAG_BLOCK_AND_DIR_AT_END
            } else {
                0
            };

        let directory_infos: Vec<DirectoryInfo> = info
            .directory_infos
            .iter()
            .map(|entry| entry.without_replacer())
            .collect();

        if block_dir_at_end {
            let start = writer.stream_position()?;
            new_header.write(writer)?;
            if self.uses_block_alignment {
                align_writer(writer, 16)?;
            }
            let blocks = compress_data_region(data, writer, data_len, compression, progress)?;
            let listing_bytes = serialize_listing(info.hash, blocks, directory_infos)?;
            let compressed_listing = codec::lz4_compress_block(&listing_bytes, Lz4Level::Hc)?;
            writer.write_all(&compressed_listing)?;
            let end = writer.stream_position()?;
            new_header.fs.compressed_size = compressed_listing.len() as u32;
            new_header.fs.decompressed_size = listing_bytes.len() as u32;
            new_header.fs.total_file_size = (end - start) as i64;
            writer.seek(SeekFrom::Start(start))?;
            new_header.write(writer)?;
            writer.seek(SeekFrom::Start(end))?;
        } else {
            // Stage the compressed payload so the listing, whose size must
            // precede it, can be written first.
            let mut staging = tempfile::tempfile()?;
            let blocks = compress_data_region(data, &mut staging, data_len, compression, progress)?;
            let listing_bytes = serialize_listing(info.hash, blocks, directory_infos)?;
            let compressed_listing = codec::lz4_compress_block(&listing_bytes, Lz4Level::Hc)?;
            new_header.fs.compressed_size = compressed_listing.len() as u32;
            new_header.fs.decompressed_size = listing_bytes.len() as u32;

            let start = writer.stream_position()?;
            new_header.write(writer)?;
            if self.uses_block_alignment {
                align_writer(writer, 16)?;
            }
            writer.write_all(&compressed_listing)?;
            staging.seek(SeekFrom::Start(0))?;
            io::copy(&mut staging, writer)?;
            let end = writer.stream_position()?;
            new_header.fs.total_file_size = (end - start) as i64;
            writer.seek(SeekFrom::Start(start))?;
            new_header.write(writer)?;
            writer.seek(SeekFrom::Start(end))?;
        }
        Ok(())
    }
}

fn decompress_listing(
    data: &[u8],
    compression: CompressionType,
    decompressed_size: u32,
) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            codec::lz4_decompress_block(data, decompressed_size as usize)
        }
        CompressionType::Lzma => codec::lzma_decompress_block(data, decompressed_size as usize),
    }
}

/// The data region is classified by the first block that declares a
/// compression type; mixed bundles are rejected later, at decode time.
fn classify_data(blocks: &[BlockInfo]) -> Result<CompressionType> {
    for block in blocks {
        let compression = block.compression_type()?;
        if compression != CompressionType::None {
            return Ok(compression);
        }
    }
    Ok(CompressionType::None)
}

fn serialize_listing(
    hash: Hash128,
    block_infos: Vec<BlockInfo>,
    directory_infos: Vec<DirectoryInfo>,
) -> Result<Vec<u8>> {
    let info = BlockAndDirInfo {
        hash,
        block_infos,
        directory_infos,
    };
    let mut buffer = Cursor::new(Vec::new());
    info.write(&mut buffer)?;
    Ok(buffer.into_inner())
}

fn compress_data_region<R: Read + Seek, W: Write + Seek>(
    data: &mut R,
    output: &mut W,
    data_len: u64,
    compression: CompressionType,
    mut progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<Vec<BlockInfo>> {
    data.seek(SeekFrom::Start(0))?;
    match compression {
        CompressionType::None => {
            ensure_single_block(data_len)?;
            copy_exact(data, output, data_len)?;
            report(&mut progress, data_len, data_len);
            Ok(vec![BlockInfo {
                decompressed_size: data_len as u32,
                compressed_size: data_len as u32,
                flags: 0,
            }])
        }
        CompressionType::Lzma => {
            ensure_single_block(data_len)?;
            let mut limited = (&mut *data).take(data_len);
            let (_, written) = codec::lzma_compress_stream(&mut limited, output)?;
            if written > u64::from(u32::MAX) {
                return Err(Error::Unsupported(
                    "compressed data region too large for a single block",
                ));
            }
            report(&mut progress, data_len, data_len);
            Ok(vec![BlockInfo {
                decompressed_size: data_len as u32,
                compressed_size: written as u32,
                flags: BLOCK_FLAG_STREAMED | CompressionType::Lzma as u16,
            }])
        }
        CompressionType::Lz4 | CompressionType::Lz4Hc => {
            let mut blocks = Vec::new();
            let mut buf = vec![0u8; LZ4_PACK_CHUNK];
            let mut remaining = data_len;
            let mut done = 0u64;
            while remaining > 0 {
                let take = remaining.min(LZ4_PACK_CHUNK as u64) as usize;
                data.read_exact(&mut buf[..take])
                    .map_err(|_| Error::MalformedInput("data region ended early"))?;
                let compressed = codec::lz4_compress_block(&buf[..take], Lz4Level::Hc)?;
                if compressed.len() > take {
                    output.write_all(&buf[..take])?;
                    blocks.push(BlockInfo {
                        decompressed_size: take as u32,
                        compressed_size: take as u32,
                        flags: 0,
                    });
                } else {
                    output.write_all(&compressed)?;
                    blocks.push(BlockInfo {
                        decompressed_size: take as u32,
                        compressed_size: compressed.len() as u32,
                        flags: compression as u16,
                    });
                }
                remaining -= take as u64;
                done += take as u64;
                report(&mut progress, done, data_len);
            }
            if blocks.is_empty() {
                blocks.push(BlockInfo {
                    decompressed_size: 0,
                    compressed_size: 0,
                    flags: 0,
                });
                report(&mut progress, 0, 0);
            }
            Ok(blocks)
        }
    }
}

/// Number of zero-compression blocks needed to span `total` bytes, each
/// holding at most `u32::MAX` of them.
fn block_count_for(total: u64) -> u64 {
    total.div_ceil(u64::from(u32::MAX)).max(1)
}

fn ensure_single_block(data_len: u64) -> Result<()> {
    if data_len > u64::from(u32::MAX) {
        return Err(Error::Unsupported(
            "data region too large for single-block compression",
        ));
    }
    Ok(())
}

fn report(progress: &mut Option<&mut dyn FnMut(u64, u64)>, done: u64, total: u64) {
    if let Some(callback) = progress {
        callback(done, total);
    }
}

fn copy_exact<R: Read, W: Write>(input: &mut R, output: &mut W, mut size: u64) -> Result<()> {
    let mut buffer = vec![0u8; 1024 * 1024];
    while size > 0 {
        let want = size.min(buffer.len() as u64) as usize;
        input
            .read_exact(&mut buffer[..want])
            .map_err(|_| Error::MalformedInput("data region ended early"))?;
        output.write_all(&buffer[..want])?;
        size -= want as u64;
    }
    Ok(())
}

/// Pulls the `major.minor.patch` triple out of an engine version string
/// such as "2019.4.31f1".
fn parse_engine_version(value: &str) -> Option<(u32, u32, u32)> {
    let mut parts = value
        .split(|ch: char| !ch.is_ascii_digit())
        .filter_map(|part| part.parse::<u32>().ok());
    Some((parts.next()?, parts.next()?, parts.next()?))
}

/// Whether the engine moved the archive flag bits. That shipped in
/// 2020.3.34, 2021.3.2 and 2022.1.1.
fn uses_new_archive_flags(version: (u32, u32, u32)) -> bool {
    let cutover = match version.0 {
        major if major < 2020 => return false,
        2020 => (2020, 3, 34),
        2021 => (2021, 3, 2),
        2022 => (2022, 1, 1),
        _ => return true,
    };
    version >= cutover
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: u32, flags: u32, compressed_size: u32) -> AssetBundleHeader {
        AssetBundleHeader {
            signature: SIGNATURE.to_string(),
            version,
            generation_version: "5.x.x".to_string(),
            engine_version: "2019.4.0f1".to_string(),
            fs: FsHeader {
                total_file_size: 4096,
                compressed_size,
                decompressed_size: compressed_size,
                flags,
            },
        }
    }

    #[test]
    fn header_round_trip() {
        let original = header(7, 0x43, 90);
        let mut buf = Cursor::new(Vec::new());
        original.write(&mut buf).unwrap();
        buf.set_position(0);
        let reread = AssetBundleHeader::read(&mut buf).unwrap();
        assert_eq!(reread, original);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        let mut bad = header(7, 0, 0);
        bad.signature = "UnityWeb".to_string();
        bad.write(&mut buf).unwrap();
        buf.set_position(0);
        assert!(matches!(
            AssetBundleHeader::read(&mut buf),
            Err(Error::UnsupportedSignature(_))
        ));
    }

    #[test]
    fn out_of_range_version_is_rejected() {
        for version in [5, 9] {
            let mut buf = Cursor::new(Vec::new());
            header(version, 0, 0).write(&mut buf).unwrap();
            buf.set_position(0);
            assert!(matches!(
                AssetBundleHeader::read(&mut buf),
                Err(Error::UnsupportedVersion(v)) if v == version
            ));
        }
    }

    #[test]
    fn derived_offsets() {
        // base_size for these strings: 8 + 4 + 6 + 11 + 20 = 49.
        let plain = header(6, 0, 100);
        assert_eq!(plain.bundle_info_offset(), 49);
        assert_eq!(plain.file_data_offset(), 149);

        let aligned = header(7, 0, 100);
        assert_eq!(aligned.bundle_info_offset(), 64);
        assert_eq!(aligned.file_data_offset(), 164);

        let padded = header(7, FLAG_BLOCK_INFO_NEED_PADDING, 100);
        assert_eq!(padded.file_data_offset(), 176);

        let mut at_end = header(7, FLAG_BLOCK_AND_DIR_AT_END, 100);
        at_end.fs.total_file_size = 1000;
        assert_eq!(at_end.bundle_info_offset(), 900);
        assert_eq!(at_end.file_data_offset(), 64);
    }

    #[test]
    fn listing_round_trip() {
        let info = BlockAndDirInfo {
            hash: Hash128([7u8; 16]),
            block_infos: vec![
                BlockInfo {
                    decompressed_size: 64,
                    compressed_size: 32,
                    flags: 2,
                },
                BlockInfo {
                    decompressed_size: 16,
                    compressed_size: 16,
                    flags: 0,
                },
            ],
            directory_infos: vec![
                DirectoryInfo::new("CAB-a", 0, 64, 4),
                DirectoryInfo::new("CAB-a.resS", 64, 16, 0),
            ],
        };
        let mut buf = Cursor::new(Vec::new());
        info.write(&mut buf).unwrap();
        buf.set_position(0);
        let reread = BlockAndDirInfo::read(&mut buf).unwrap();
        assert_eq!(reread.hash, info.hash);
        assert_eq!(reread.block_infos, info.block_infos);
        assert_eq!(reread.directory_infos, info.directory_infos);
        assert_eq!(reread.data_len(), 80);
    }

    #[test]
    fn data_classification_picks_first_compressed_block() {
        let none = BlockInfo {
            decompressed_size: 1,
            compressed_size: 1,
            flags: 0,
        };
        let lz4 = BlockInfo { flags: 2, ..none };
        let lzma = BlockInfo { flags: 1, ..none };
        assert_eq!(classify_data(&[none, none]).unwrap(), CompressionType::None);
        assert_eq!(classify_data(&[none, lz4]).unwrap(), CompressionType::Lz4);
        assert_eq!(classify_data(&[lzma, lz4]).unwrap(), CompressionType::Lzma);
        assert!(classify_data(&[BlockInfo { flags: 4, ..none }]).is_err());
    }

    #[test]
    fn block_count_boundaries() {
        assert_eq!(block_count_for(0), 1);
        assert_eq!(block_count_for(1), 1);
        assert_eq!(block_count_for(u64::from(u32::MAX)), 1);
        assert_eq!(block_count_for(u64::from(u32::MAX) + 1), 2);
    }

    #[test]
    fn engine_version_parsing() {
        assert_eq!(parse_engine_version("2019.4.31f1"), Some((2019, 4, 31)));
        assert_eq!(parse_engine_version("2022.3.5p2"), Some((2022, 3, 5)));
        assert_eq!(parse_engine_version("garbage"), None);
    }

    #[test]
    fn new_archive_flag_cutover() {
        assert!(!uses_new_archive_flags((2019, 4, 0)));
        assert!(!uses_new_archive_flags((2020, 3, 33)));
        assert!(uses_new_archive_flags((2020, 3, 34)));
        assert!(!uses_new_archive_flags((2021, 3, 1)));
        assert!(uses_new_archive_flags((2021, 3, 2)));
        assert!(uses_new_archive_flags((2023, 1, 0)));
    }
}
