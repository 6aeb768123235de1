//! LZ4 and LZMA adapters in the byte layouts Unity uses.
//!
//! LZ4 is a raw block codec with sizes carried out of band. LZMA uses the
//! standalone "alone" framing: 5 properties bytes, an 8-byte little-endian
//! uncompressed size, then the stream. Unity's own blocks omit the size
//! field, so the decoder accepts both layouts and the encoder always writes
//! a real size.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::{Error, Result};

const LZMA_PROPS_SIZE: usize = 5;
const LZMA_HEADER_SIZE: usize = 13;
const LZMA_SIZE_UNKNOWN: u64 = u64::MAX;

/// Compression effort for LZ4 block encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lz4Level {
    Fast,
    Hc,
    HcMax,
}

pub fn lz4_compress_block(input: &[u8], level: Lz4Level) -> Result<Vec<u8>> {
    let mode = match level {
        Lz4Level::Fast => lz4::block::CompressionMode::DEFAULT,
        Lz4Level::Hc => lz4::block::CompressionMode::HIGHCOMPRESSION(9),
        Lz4Level::HcMax => lz4::block::CompressionMode::HIGHCOMPRESSION(12),
    };
    lz4::block::compress(input, Some(mode), false).map_err(|_| Error::Codec("LZ4 compression failed"))
}

pub fn lz4_decompress_block(input: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    let size =
        i32::try_from(decompressed_size).map_err(|_| Error::Codec("LZ4 block size overflow"))?;
    let output = lz4::block::decompress(input, Some(size))
        .map_err(|_| Error::Codec("LZ4 decompression failed"))?;
    if output.len() != decompressed_size {
        return Err(Error::Codec("LZ4 block decoded to an unexpected length"));
    }
    Ok(output)
}

/// LZMA1 encoder options matching Unity's defaults (as AssetsTools uses
/// them).
fn lzma_options() -> Result<xz2::stream::LzmaOptions> {
    let mut options = xz2::stream::LzmaOptions::new_preset(6)
        .map_err(|_| Error::Codec("LZMA encoder options rejected"))?;
    options
        .dict_size(0x0080_0000)
        .literal_context_bits(3)
        .literal_position_bits(0)
        .position_bits(2)
        .mode(xz2::stream::Mode::Normal)
        .match_finder(xz2::stream::MatchFinder::BinaryTree4)
        .nice_len(123);
    Ok(options)
}

/// Compresses `input` into the alone format, returning
/// `(bytes read, bytes written)`.
///
/// liblzma leaves the header's size field unknown when encoding from a
/// stream; the field is patched with the counted input length afterwards,
/// which is why the output must be seekable.
pub fn lzma_compress_stream<R: Read, W: Write + Seek>(
    input: &mut R,
    output: &mut W,
) -> Result<(u64, u64)> {
    let start = output.stream_position()?;
    let options = lzma_options()?;
    let stream = xz2::stream::Stream::new_lzma_encoder(&options)
        .map_err(|_| Error::Codec("LZMA encoder rejected its options"))?;
    let mut encoder = xz2::write::XzEncoder::new_stream(&mut *output, stream);
    let read = io::copy(input, &mut encoder)?;
    encoder.finish()?;

    let end = output.stream_position()?;
    if end - start < LZMA_HEADER_SIZE as u64 {
        return Err(Error::Codec("LZMA output too small for its header"));
    }
    output.seek(SeekFrom::Start(start + LZMA_PROPS_SIZE as u64))?;
    output.write_all(&read.to_le_bytes())?;
    output.seek(SeekFrom::Start(end))?;
    Ok((read, end - start))
}

/// Decompresses an alone-format stream, with or without the embedded size
/// field, until `decompressed_size` bytes have been produced.
///
/// `compressed_size` bounds how much of `input` may be consumed; pass
/// `None` when the input ends with the stream.
pub fn lzma_decompress_stream<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    decompressed_size: u64,
    compressed_size: Option<u64>,
) -> Result<u64> {
    let mut props = [0u8; LZMA_PROPS_SIZE];
    input
        .read_exact(&mut props)
        .map_err(|_| Error::Codec("LZMA input too small for its header"))?;
    let mut budget = match compressed_size {
        Some(size) => Some(
            size.checked_sub(LZMA_PROPS_SIZE as u64)
                .ok_or(Error::Codec("LZMA input too small for its header"))?,
        ),
        None => None,
    };

    // The 8 bytes after the properties are an original-size field when the
    // producer wrote one (this library does; Unity does not). Consume them
    // only when they are recognizably a size.
    let mut carry = [0u8; 8];
    let mut carried = 0;
    if budget.map_or(true, |remaining| remaining >= 8) {
        let got = read_up_to(input, &mut carry)?;
        let value = u64::from_le_bytes(carry);
        if got == 8 && (value == decompressed_size || value == LZMA_SIZE_UNKNOWN) {
            if let Some(remaining) = budget.as_mut() {
                *remaining -= 8;
            }
        } else {
            carried = got;
        }
    }

    let mut header = [0u8; LZMA_HEADER_SIZE];
    header[..LZMA_PROPS_SIZE].copy_from_slice(&props);
    header[LZMA_PROPS_SIZE..].copy_from_slice(&decompressed_size.to_le_bytes());

    let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
        .map_err(|_| Error::Codec("LZMA decoder rejected its options"))?;
    let tail = input.take(budget.unwrap_or(u64::MAX).saturating_sub(carried as u64));
    let reader = Cursor::new(header)
        .chain(Cursor::new(carry).take(carried as u64))
        .chain(tail);
    let mut decoder = xz2::read::XzDecoder::new_stream(reader, stream);

    let written =
        io::copy(&mut (&mut decoder).take(decompressed_size), output).map_err(|err| {
            if err.kind() == io::ErrorKind::InvalidData {
                Error::Codec("LZMA stream is corrupt")
            } else {
                Error::Io(err)
            }
        })?;
    if written != decompressed_size {
        return Err(Error::Codec("LZMA stream ended before the expected size"));
    }
    Ok(written)
}

pub fn lzma_compress_block(input: &[u8]) -> Result<Vec<u8>> {
    let mut output = Cursor::new(Vec::new());
    lzma_compress_stream(&mut Cursor::new(input), &mut output)?;
    Ok(output.into_inner())
}

pub fn lzma_decompress_block(input: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(decompressed_size);
    lzma_decompress_stream(
        &mut Cursor::new(input),
        &mut output,
        decompressed_size as u64,
        Some(input.len() as u64),
    )?;
    Ok(output)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..4096u32 {
            data.extend_from_slice(&(i % 251).to_be_bytes());
        }
        data
    }

    #[test]
    fn lz4_round_trip() {
        let data = sample();
        for level in [Lz4Level::Fast, Lz4Level::Hc, Lz4Level::HcMax] {
            let compressed = lz4_compress_block(&data, level).unwrap();
            let decompressed = lz4_decompress_block(&compressed, data.len()).unwrap();
            assert_eq!(decompressed, data);
        }
    }

    #[test]
    fn lz4_length_mismatch_is_a_codec_error() {
        let data = sample();
        let compressed = lz4_compress_block(&data, Lz4Level::Fast).unwrap();
        assert!(lz4_decompress_block(&compressed, data.len() + 1).is_err());
    }

    #[test]
    fn lzma_round_trip_with_size_field() {
        let data = sample();
        let compressed = lzma_compress_block(&data).unwrap();
        // The encoder writes the real size, not the unknown marker.
        assert_eq!(
            u64::from_le_bytes(compressed[5..13].try_into().unwrap()),
            data.len() as u64
        );
        let decompressed = lzma_decompress_block(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lzma_round_trip_without_size_field() {
        // Unity blocks are properties followed directly by the stream.
        let data = sample();
        let compressed = lzma_compress_block(&data).unwrap();
        let mut stripped = compressed[..5].to_vec();
        stripped.extend_from_slice(&compressed[13..]);
        let decompressed = lzma_decompress_block(&stripped, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lzma_truncated_input_fails() {
        let data = sample();
        let compressed = lzma_compress_block(&data).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(lzma_decompress_block(truncated, data.len()).is_err());
    }
}
