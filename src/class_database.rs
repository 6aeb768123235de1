//! Class database container: a compressed table of asset types with an
//! interned string table, consumed by downstream asset parsers.

use std::borrow::Cow;
use std::io::{Cursor, Read, Write};

use tracing::debug;

use crate::binary::{
    read_bytes, read_i32_be, read_string_to_null, read_u16_be, read_u32_be, read_u8, write_i32_be,
    write_string_to_null, write_u16_be, write_u32_be, write_u8,
};
use crate::codec::{self, Lz4Level};
use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"CLDB";
const FILE_VERSION: u8 = 1;

/// Type id Unity rewrote pre-5.5 negative ids to.
const LEGACY_SCRIPT_CLASS_ID: i32 = 0x72;

/// Compression of the class database payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassDatabaseCompressionType {
    Uncompressed = 0,
    Lz4 = 1,
    Lzma = 2,
}

impl ClassDatabaseCompressionType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Uncompressed),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Lzma),
            other => Err(Error::UnsupportedCompression(u32::from(other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDatabaseHeader {
    pub file_version: u8,
    pub compression_type: ClassDatabaseCompressionType,
    pub compressed_size: u32,
    pub decompressed_size: u32,
}

impl Default for ClassDatabaseHeader {
    fn default() -> Self {
        Self {
            file_version: FILE_VERSION,
            compression_type: ClassDatabaseCompressionType::Uncompressed,
            compressed_size: 0,
            decompressed_size: 0,
        }
    }
}

impl ClassDatabaseHeader {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = read_bytes(reader, 4)?;
        if magic != MAGIC {
            return Err(Error::MalformedInput("bad class database magic"));
        }
        let file_version = read_u8(reader)?;
        if file_version != FILE_VERSION {
            return Err(Error::UnsupportedVersion(u32::from(file_version)));
        }
        let compression_type = ClassDatabaseCompressionType::from_u8(read_u8(reader)?)?;
        let compressed_size = read_u32_be(reader)?;
        let decompressed_size = read_u32_be(reader)?;
        Ok(Self {
            file_version,
            compression_type,
            compressed_size,
            decompressed_size,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(MAGIC)?;
        write_u8(writer, self.file_version)?;
        write_u8(writer, self.compression_type as u8)?;
        write_u32_be(writer, self.compressed_size)?;
        write_u32_be(writer, self.decompressed_size)?;
        Ok(())
    }
}

/// One asset type record. The fields beyond the id are opaque to the
/// container framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassDatabaseType {
    pub class_id: i32,
    pub base_class_id: i32,
    /// String table index of the type name.
    pub name: u16,
}

impl ClassDatabaseType {
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            class_id: read_i32_be(reader)?,
            base_class_id: read_i32_be(reader)?,
            name: read_u16_be(reader)?,
        })
    }

    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_i32_be(writer, self.class_id)?;
        write_i32_be(writer, self.base_class_id)?;
        write_u16_be(writer, self.name)?;
        Ok(())
    }
}

/// Interned strings addressed by `u16` indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassDatabaseStringTable {
    strings: Vec<String>,
}

impl ClassDatabaseStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u16) -> Option<&str> {
        self.strings.get(usize::from(index)).map(String::as_str)
    }

    /// Interns a string, reusing an existing slot when present.
    pub fn add(&mut self, value: impl Into<String>) -> u16 {
        let value = value.into();
        if let Some(at) = self.strings.iter().position(|existing| *existing == value) {
            return at as u16;
        }
        self.strings.push(value);
        (self.strings.len() - 1) as u16
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_u32_be(reader)? as usize;
        let mut strings = Vec::with_capacity(count);
        for _ in 0..count {
            strings.push(read_string_to_null(reader)?);
        }
        Ok(Self { strings })
    }

    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u32_be(writer, self.strings.len() as u32)?;
        for value in &self.strings {
            write_string_to_null(writer, value)?;
        }
        Ok(())
    }
}

/// A class database file: header plus a possibly-compressed payload of
/// type records, the string table, and the well-known-string index list.
#[derive(Debug, Default)]
pub struct ClassDatabaseFile {
    pub header: ClassDatabaseHeader,
    pub classes: Vec<ClassDatabaseType>,
    pub string_table: ClassDatabaseStringTable,
    pub common_string_indices: Vec<u16>,
}

impl ClassDatabaseFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let header = ClassDatabaseHeader::read(reader)?;
        let payload = read_bytes(reader, header.compressed_size as usize)?;
        let decompressed = match header.compression_type {
            ClassDatabaseCompressionType::Uncompressed => payload,
            ClassDatabaseCompressionType::Lz4 => {
                codec::lz4_decompress_block(&payload, header.decompressed_size as usize)?
            }
            ClassDatabaseCompressionType::Lzma => {
                codec::lzma_decompress_block(&payload, header.decompressed_size as usize)?
            }
        };
        debug!(
            compression = ?header.compression_type,
            payload = decompressed.len(),
            "read class database"
        );

        let mut cursor = Cursor::new(decompressed);
        let class_count = read_u32_be(&mut cursor)? as usize;
        let mut classes = Vec::with_capacity(class_count);
        for _ in 0..class_count {
            classes.push(ClassDatabaseType::read(&mut cursor)?);
        }
        let string_table = ClassDatabaseStringTable::read(&mut cursor)?;
        let common_count = read_u32_be(&mut cursor)? as usize;
        let mut common_string_indices = Vec::with_capacity(common_count);
        for _ in 0..common_count {
            common_string_indices.push(read_u16_be(&mut cursor)?);
        }

        Ok(Self {
            header,
            classes,
            string_table,
            common_string_indices,
        })
    }

    /// Serializes the database, compressing the payload as requested and
    /// refreshing the header sizes.
    pub fn write<W: Write>(
        &mut self,
        writer: &mut W,
        compression: ClassDatabaseCompressionType,
    ) -> Result<()> {
        let mut payload = Cursor::new(Vec::new());
        write_u32_be(&mut payload, self.classes.len() as u32)?;
        for class in &self.classes {
            class.write(&mut payload)?;
        }
        self.string_table.write(&mut payload)?;
        write_u32_be(&mut payload, self.common_string_indices.len() as u32)?;
        for index in &self.common_string_indices {
            write_u16_be(&mut payload, *index)?;
        }
        let payload = payload.into_inner();

        let compressed: Cow<'_, [u8]> = match compression {
            ClassDatabaseCompressionType::Uncompressed => Cow::Borrowed(&payload),
            ClassDatabaseCompressionType::Lz4 => {
                Cow::Owned(codec::lz4_compress_block(&payload, Lz4Level::Hc)?)
            }
            ClassDatabaseCompressionType::Lzma => Cow::Owned(codec::lzma_compress_block(&payload)?),
        };

        self.header.compression_type = compression;
        self.header.compressed_size = compressed.len() as u32;
        self.header.decompressed_size = payload.len() as u32;
        self.header.write(writer)?;
        writer.write_all(&compressed)?;
        Ok(())
    }

    /// Looks a type up by id. Negative ids are a pre-5.5 encoding of
    /// MonoBehaviour scripts and resolve as `0x72`.
    pub fn find_asset_class_by_id(&self, class_id: i32) -> Option<&ClassDatabaseType> {
        let class_id = if class_id < 0 {
            LEGACY_SCRIPT_CLASS_ID
        } else {
            class_id
        };
        self.classes.iter().find(|class| class.class_id == class_id)
    }

    pub fn find_asset_class_by_name(&self, name: &str) -> Option<&ClassDatabaseType> {
        self.classes
            .iter()
            .find(|class| self.string_table.get(class.name) == Some(name))
    }

    pub fn get_string(&self, index: u16) -> Option<&str> {
        self.string_table.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClassDatabaseFile {
        let mut file = ClassDatabaseFile::new();
        let game_object = file.string_table.add("GameObject");
        let mono = file.string_table.add("MonoBehaviour");
        file.classes.push(ClassDatabaseType {
            class_id: 1,
            base_class_id: -1,
            name: game_object,
        });
        file.classes.push(ClassDatabaseType {
            class_id: 0x72,
            base_class_id: 1,
            name: mono,
        });
        file.common_string_indices = vec![game_object];
        file
    }

    #[test]
    fn round_trip_all_compression_types() {
        for compression in [
            ClassDatabaseCompressionType::Uncompressed,
            ClassDatabaseCompressionType::Lz4,
            ClassDatabaseCompressionType::Lzma,
        ] {
            let mut original = sample();
            let mut buf = Cursor::new(Vec::new());
            original.write(&mut buf, compression).unwrap();
            buf.set_position(0);
            let reread = ClassDatabaseFile::read(&mut buf).unwrap();
            assert_eq!(reread.header.compression_type, compression);
            assert_eq!(reread.classes, original.classes);
            assert_eq!(reread.string_table, original.string_table);
            assert_eq!(reread.common_string_indices, original.common_string_indices);
        }
    }

    #[test]
    fn negative_ids_resolve_as_the_legacy_script_class() {
        let file = sample();
        let by_negative = file.find_asset_class_by_id(-1).unwrap();
        let by_legacy = file.find_asset_class_by_id(0x72).unwrap();
        assert_eq!(by_negative, by_legacy);
    }

    #[test]
    fn lookup_by_name() {
        let file = sample();
        let class = file.find_asset_class_by_name("GameObject").unwrap();
        assert_eq!(class.class_id, 1);
        assert!(file.find_asset_class_by_name("Texture2D").is_none());
    }

    #[test]
    fn string_interning_reuses_slots() {
        let mut table = ClassDatabaseStringTable::new();
        let first = table.add("A");
        let again = table.add("A");
        let second = table.add("B");
        assert_eq!(first, again);
        assert_ne!(first, second);
        assert_eq!(table.get(second), Some("B"));
        assert_eq!(table.get(99), None);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Cursor::new(b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00".to_vec());
        assert!(matches!(
            ClassDatabaseFile::read(&mut buf),
            Err(Error::MalformedInput(_))
        ));
    }
}
