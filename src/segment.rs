//! Windowed view over a parent stream.

use std::io::{self, Read, Seek, SeekFrom};

/// Exposes `[start, start + len)` of a parent stream as an independently
/// positioned stream.
///
/// Every read re-seeks the parent, so the parent must not be shared while
/// the segment is alive. Positions past the window read as end-of-stream.
#[derive(Debug)]
pub struct SegmentStream<R> {
    parent: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SegmentStream<R> {
    pub fn new(parent: R, start: u64, len: u64) -> Self {
        Self {
            parent,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_inner(self) -> R {
        self.parent
    }
}

impl<R: Read + Seek> Read for SegmentStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remaining = self.len - self.pos;
        let want = if remaining < buf.len() as u64 {
            remaining as usize
        } else {
            buf.len()
        };
        self.parent.seek(SeekFrom::Start(self.start + self.pos))?;
        let read = self.parent.read(&mut buf[..want])?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<R: Read + Seek> Seek for SegmentStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of segment",
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

    fn parent() -> Cursor<Vec<u8>> {
        Cursor::new((0u8..32).collect())
    }

    #[test]
    fn reads_are_windowed() {
        let mut segment = SegmentStream::new(parent(), 8, 8);
        let mut buf = Vec::new();
        segment.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, (8u8..16).collect::<Vec<_>>());
    }

    #[test]
    fn reads_stop_at_the_window_end() {
        let mut segment = SegmentStream::new(parent(), 28, 10);
        let mut buf = Vec::new();
        segment.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![28, 29, 30, 31]);
    }

    #[test]
    fn seeking_is_independent_of_the_parent() {
        let mut segment = SegmentStream::new(parent(), 4, 16);
        segment.seek(SeekFrom::Start(10)).unwrap();
        let mut byte = [0u8; 1];
        segment.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 14);

        segment.seek(SeekFrom::Current(-1)).unwrap();
        segment.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 14);

        segment.seek(SeekFrom::End(-1)).unwrap();
        segment.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 19);
    }

    #[test]
    fn seek_before_start_is_rejected() {
        let mut segment = SegmentStream::new(parent(), 4, 16);
        assert!(segment.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn reads_past_the_end_return_zero() {
        let mut segment = SegmentStream::new(parent(), 4, 4);
        segment.seek(SeekFrom::Start(100)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(segment.read(&mut buf).unwrap(), 0);
    }
}
