//! Class database round-trips through a real file.

use std::io::{Seek, SeekFrom};

use anyhow::Result;
use unityfs::class_database::{
    ClassDatabaseCompressionType, ClassDatabaseFile, ClassDatabaseType,
};

fn sample() -> ClassDatabaseFile {
    let mut file = ClassDatabaseFile::new();
    let a = file.string_table.add("A");
    let b = file.string_table.add("B");
    file.classes.push(ClassDatabaseType {
        class_id: 1,
        base_class_id: -1,
        name: a,
    });
    file.classes.push(ClassDatabaseType {
        class_id: 2,
        base_class_id: 1,
        name: b,
    });
    file.common_string_indices = vec![0];
    file
}

#[test]
fn file_round_trip_for_each_compression_type() -> Result<()> {
    for compression in [
        ClassDatabaseCompressionType::Uncompressed,
        ClassDatabaseCompressionType::Lz4,
        ClassDatabaseCompressionType::Lzma,
    ] {
        let mut original = sample();
        let mut file = tempfile::tempfile()?;
        original.write(&mut file, compression)?;

        file.seek(SeekFrom::Start(0))?;
        let reread = ClassDatabaseFile::read(&mut file)?;
        assert_eq!(reread.header.compression_type, compression);
        assert_eq!(reread.classes, original.classes);
        assert_eq!(reread.string_table, original.string_table);
        assert_eq!(reread.common_string_indices, original.common_string_indices);
        assert_eq!(reread.get_string(reread.classes[1].name), Some("B"));
    }
    Ok(())
}
