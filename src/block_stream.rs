//! Random access over a list of LZ4-compressed blocks.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::trace;

use crate::bundle::{BlockInfo, CompressionType};
use crate::codec;
use crate::{Error, Result};

/// Decoded blocks kept around for nearby reads.
const CACHED_BLOCKS: usize = 4;

/// Seekable view of the decompressed data region of a bundle whose blocks
/// are LZ4-compressed (raw blocks pass through unchanged).
///
/// Blocks are decoded whole on first touch and kept in a small LRU list.
/// Seeking alone never decodes, and cached blocks are read-only snapshots.
pub struct Lz4BlockStream<R> {
    parent: R,
    data_offset: u64,
    blocks: Vec<BlockInfo>,
    compressed_starts: Vec<u64>,
    // One extra entry holding the total decompressed length.
    decompressed_starts: Vec<u64>,
    pos: u64,
    cache: VecDeque<(usize, Vec<u8>)>,
}

impl<R: Read + Seek> Lz4BlockStream<R> {
    /// `data_offset` is where the block data begins in the parent stream.
    pub fn new(parent: R, data_offset: u64, blocks: Vec<BlockInfo>) -> Self {
        let mut compressed_starts = Vec::with_capacity(blocks.len());
        let mut decompressed_starts = Vec::with_capacity(blocks.len() + 1);
        let mut compressed = 0u64;
        let mut decompressed = 0u64;
        for block in &blocks {
            compressed_starts.push(compressed);
            decompressed_starts.push(decompressed);
            compressed += u64::from(block.compressed_size);
            decompressed += u64::from(block.decompressed_size);
        }
        decompressed_starts.push(decompressed);
        Self {
            parent,
            data_offset,
            blocks,
            compressed_starts,
            decompressed_starts,
            pos: 0,
            cache: VecDeque::new(),
        }
    }

    /// Total decompressed length of all blocks.
    pub fn len(&self) -> u64 {
        self.decompressed_starts.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn block_index(&self, pos: u64) -> Option<usize> {
        if pos >= self.len() {
            return None;
        }
        // First start beyond `pos`, minus one; zero-sized blocks collapse
        // onto the same start and are skipped over.
        let next = self.decompressed_starts.partition_point(|&start| start <= pos);
        Some(next - 1)
    }

    fn block_data(&mut self, index: usize) -> Result<&[u8]> {
        match self.cache.iter().position(|(cached, _)| *cached == index) {
            Some(0) => {
                trace!(block = index, "block cache hit");
            }
            Some(at) => {
                trace!(block = index, "block cache hit");
                if let Some(entry) = self.cache.remove(at) {
                    self.cache.push_front(entry);
                }
            }
            None => {
                trace!(block = index, "decoding block");
                let data = self.decode_block(index)?;
                self.cache.truncate(CACHED_BLOCKS - 1);
                self.cache.push_front((index, data));
            }
        }
        match self.cache.front() {
            Some((_, data)) => Ok(data),
            None => Err(Error::MalformedInput("block lookup on an empty block list")),
        }
    }

    fn decode_block(&mut self, index: usize) -> Result<Vec<u8>> {
        let block = &self.blocks[index];
        let compression = CompressionType::from_block_flags(block.flags)?;
        let mut compressed = vec![0u8; block.compressed_size as usize];
        self.parent
            .seek(SeekFrom::Start(self.data_offset + self.compressed_starts[index]))?;
        self.parent.read_exact(&mut compressed)?;
        match compression {
            CompressionType::None => Ok(compressed),
            CompressionType::Lz4 | CompressionType::Lz4Hc => {
                codec::lz4_decompress_block(&compressed, block.decompressed_size as usize)
            }
            // The region was classified as LZ4; a stray LZMA block means a
            // mixed-compression bundle, which is not accepted.
            CompressionType::Lzma => Err(Error::UnsupportedCompression(compression as u32)),
        }
    }
}

impl<R: Read + Seek> Read for Lz4BlockStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let Some(index) = self.block_index(self.pos) else {
                break;
            };
            let within = (self.pos - self.decompressed_starts[index]) as usize;
            let data = self.block_data(index).map_err(io::Error::other)?;
            let take = (data.len() - within).min(buf.len() - filled);
            if take == 0 {
                break;
            }
            buf[filled..filled + take].copy_from_slice(&data[within..within + take]);
            filled += take;
            self.pos += take as u64;
        }
        Ok(filled)
    }
}

impl<R: Read + Seek> Seek for Lz4BlockStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len()) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::Lz4Level;

    const LEAD_IN: usize = 24;

    /// Builds a parent stream with `chunks` stored as LZ4 blocks (raw when
    /// marked) behind `LEAD_IN` junk bytes, plus the flat concatenation.
    fn build(chunks: &[(&[u8], bool)]) -> (Cursor<Vec<u8>>, Vec<BlockInfo>, Vec<u8>) {
        let mut parent = vec![0xAAu8; LEAD_IN];
        let mut blocks = Vec::new();
        let mut flat = Vec::new();
        for (chunk, raw) in chunks {
            let stored = if *raw {
                chunk.to_vec()
            } else {
                codec::lz4_compress_block(chunk, Lz4Level::Hc).unwrap()
            };
            blocks.push(BlockInfo {
                decompressed_size: chunk.len() as u32,
                compressed_size: stored.len() as u32,
                flags: if *raw { 0 } else { CompressionType::Lz4 as u16 },
            });
            parent.extend_from_slice(&stored);
            flat.extend_from_slice(chunk);
        }
        (Cursor::new(parent), blocks, flat)
    }

    fn chunk(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn sequential_read_matches_flat_data() {
        let a = chunk(300, 3);
        let b = chunk(200, 7);
        let c = chunk(100, 11);
        let (parent, blocks, flat) = build(&[(&a, false), (&b, true), (&c, false)]);
        let mut stream = Lz4BlockStream::new(parent, LEAD_IN as u64, blocks);
        assert_eq!(stream.len(), flat.len() as u64);
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        assert_eq!(all, flat);
    }

    #[test]
    fn reads_across_block_boundaries() {
        let a = chunk(256, 5);
        let b = chunk(256, 9);
        let (parent, blocks, flat) = build(&[(&a, false), (&b, false)]);
        let mut stream = Lz4BlockStream::new(parent, LEAD_IN as u64, blocks);
        stream.seek(SeekFrom::Start(200)).unwrap();
        let mut buf = vec![0u8; 112];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, &flat[200..312]);
    }

    #[test]
    fn repeated_reads_return_identical_bytes() {
        let a = chunk(512, 13);
        let (parent, blocks, flat) = build(&[(&a, false)]);
        let mut stream = Lz4BlockStream::new(parent, LEAD_IN as u64, blocks);
        for _ in 0..3 {
            stream.seek(SeekFrom::Start(100)).unwrap();
            let mut buf = vec![0u8; 50];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(buf, &flat[100..150]);
        }
    }

    #[test]
    fn eviction_does_not_corrupt_reads() {
        // More blocks than the cache holds, visited twice.
        let chunks: Vec<Vec<u8>> = (0..(CACHED_BLOCKS + 2))
            .map(|i| chunk(128, i as u8 + 2))
            .collect();
        let described: Vec<(&[u8], bool)> =
            chunks.iter().map(|c| (c.as_slice(), false)).collect();
        let (parent, blocks, flat) = build(&described);
        let mut stream = Lz4BlockStream::new(parent, LEAD_IN as u64, blocks);
        for _ in 0..2 {
            for (i, _) in chunks.iter().enumerate() {
                let start = i * 128;
                stream.seek(SeekFrom::Start(start as u64)).unwrap();
                let mut buf = vec![0u8; 128];
                stream.read_exact(&mut buf).unwrap();
                assert_eq!(buf, &flat[start..start + 128]);
            }
        }
    }

    #[test]
    fn lzma_block_in_an_lz4_region_is_rejected() {
        let a = chunk(64, 3);
        let (parent, mut blocks, _) = build(&[(&a, true)]);
        blocks[0].flags = CompressionType::Lzma as u16;
        let mut stream = Lz4BlockStream::new(parent, LEAD_IN as u64, blocks);
        let mut buf = vec![0u8; 16];
        assert!(stream.read_exact(&mut buf).is_err());
    }
}
