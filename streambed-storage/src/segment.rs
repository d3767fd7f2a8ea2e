use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use streambed_core::{Offset, Result, StreambedError};

/// A segment file holds a contiguous range of serialized messages.
pub struct Segment {
    base_offset: Offset,
    path: PathBuf,
    file: RwLock<File>,
    current_size: RwLock<u64>,
    max_size: u64,
}

impl Segment {
    /// Create a new segment starting at `base_offset`.
    pub fn create(base_offset: Offset, directory: &Path, max_size: u64) -> Result<Self> {
        let path = directory.join(format!("{:020}.log", base_offset.value()));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        Ok(Self {
            base_offset,
            path,
            file: RwLock::new(file),
            current_size: RwLock::new(0),
            max_size,
        })
    }

    /// Open an existing segment; the base offset is encoded in the filename.
    pub fn open(path: PathBuf, max_size: u64) -> Result<Self> {
        let filename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| StreambedError::Storage("invalid segment path".to_string()))?;

        let base_offset = filename
            .parse::<u64>()
            .map_err(|e| StreambedError::Storage(format!("invalid offset in filename: {e}")))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        let current_size = file
            .metadata()
            .map_err(|e| StreambedError::Storage(e.to_string()))?
            .len();

        Ok(Self {
            base_offset: Offset::new(base_offset),
            path,
            file: RwLock::new(file),
            current_size: RwLock::new(current_size),
            max_size,
        })
    }

    /// Append raw bytes, returning the file position they were written at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let mut file = self.file.write();
        let mut size = self.current_size.write();

        if *size + data.len() as u64 > self.max_size {
            return Err(StreambedError::Storage("segment is full".to_string()));
        }

        let position = *size;

        file.seek(SeekFrom::Start(position))
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        *size += data.len() as u64;

        Ok(position)
    }

    /// Read `length` bytes at `position`.
    pub fn read(&self, position: u64, length: usize) -> Result<Vec<u8>> {
        let size = *self.current_size.read();

        if position + length as u64 > size {
            return Err(StreambedError::OffsetOutOfRange(position));
        }

        let mut file = self.file.write();
        let mut buffer = vec![0u8; length];

        file.seek(SeekFrom::Start(position))
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        file.read_exact(&mut buffer)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        Ok(buffer)
    }

    /// Cut the file back to `length` bytes. Used when a suffix of the log is
    /// discarded during reconciliation.
    pub fn truncate(&self, length: u64) -> Result<()> {
        let file = self.file.write();
        let mut size = self.current_size.write();

        if length >= *size {
            return Ok(());
        }

        file.set_len(length)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        *size = length;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.read();
        file.sync_all()
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    pub fn size(&self) -> u64 {
        *self.current_size.read()
    }

    pub fn can_fit(&self, size: u64) -> bool {
        *self.current_size.read() + size <= self.max_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_appends_return_stable_positions() {
        let temp_dir = TempDir::new().unwrap();
        let segment = Segment::create(Offset::new(10), temp_dir.path(), 4096).unwrap();

        let first = segment.append(b"alpha").unwrap();
        let second = segment.append(b"bravo!").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 5);
        assert_eq!(segment.size(), 11);

        // Positions stay addressable out of write order.
        assert_eq!(segment.read(second, 6).unwrap(), b"bravo!");
        assert_eq!(segment.read(first, 5).unwrap(), b"alpha");

        // Reads past the written range are rejected.
        assert!(segment.read(second, 32).is_err());
    }

    #[test]
    fn test_truncate_discards_tail_and_reuses_space() {
        let temp_dir = TempDir::new().unwrap();
        let segment = Segment::create(Offset::new(0), temp_dir.path(), 4096).unwrap();

        segment.append(b"keep").unwrap();
        let cut = segment.size();
        segment.append(b"discard").unwrap();

        segment.truncate(cut).unwrap();
        assert_eq!(segment.size(), cut);
        assert!(segment.read(cut, 7).is_err());

        // Truncating past the end is a no-op.
        segment.truncate(cut + 100).unwrap();
        assert_eq!(segment.size(), cut);

        // The next append lands where the discarded tail used to be.
        let position = segment.append(b"replacement").unwrap();
        assert_eq!(position, cut);
        assert_eq!(segment.read(position, 11).unwrap(), b"replacement");
    }

    #[test]
    fn test_segment_reopen() {
        let temp_dir = TempDir::new().unwrap();

        let path = {
            let segment = Segment::create(Offset::new(42), temp_dir.path(), 1024).unwrap();
            segment.append(b"payload").unwrap();
            segment.sync().unwrap();
            segment.path().to_path_buf()
        };

        let reopened = Segment::open(path, 1024).unwrap();
        assert_eq!(reopened.base_offset(), Offset::new(42));
        assert_eq!(reopened.size(), 7);
    }
}
