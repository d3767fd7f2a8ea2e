use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use streambed_core::{Offset, Result, StreambedError};

/// Index entry: maps a logical offset to a physical position in the segment.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    position: u64,
    size: u32,
}

const INDEX_ENTRY_SIZE: usize = 20; // 8 + 8 + 4 bytes

/// Offset index for one segment. Entries are appended in offset order, so a
/// suffix of the file corresponds to a suffix of the offset range.
pub struct Index {
    path: PathBuf,
    file: RwLock<File>,
    entries: RwLock<BTreeMap<u64, IndexEntry>>,
}

impl Index {
    /// Create a new index next to `segment_path`.
    pub fn create(segment_path: &Path) -> Result<Self> {
        let path = segment_path.with_extension("index");

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        Ok(Self {
            path,
            file: RwLock::new(file),
            entries: RwLock::new(BTreeMap::new()),
        })
    }

    /// Open an existing index file.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        let mut entries = BTreeMap::new();
        let mut buffer = vec![0u8; INDEX_ENTRY_SIZE];

        file.seek(SeekFrom::Start(0))
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        loop {
            match file.read_exact(&mut buffer) {
                Ok(_) => {
                    let offset = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
                    let position = u64::from_le_bytes(buffer[8..16].try_into().unwrap());
                    let size = u32::from_le_bytes(buffer[16..20].try_into().unwrap());

                    entries.insert(offset, IndexEntry { position, size });
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StreambedError::Storage(e.to_string())),
            }
        }

        Ok(Self {
            path,
            file: RwLock::new(file),
            entries: RwLock::new(entries),
        })
    }

    /// Add an index entry.
    pub fn append(&self, offset: Offset, position: u64, size: u32) -> Result<()> {
        let mut file = self.file.write();
        let mut buffer = [0u8; INDEX_ENTRY_SIZE];

        buffer[0..8].copy_from_slice(&offset.value().to_le_bytes());
        buffer[8..16].copy_from_slice(&position.to_le_bytes());
        buffer[16..20].copy_from_slice(&size.to_le_bytes());

        let entry_count = self.entries.read().len() as u64;
        file.seek(SeekFrom::Start(entry_count * INDEX_ENTRY_SIZE as u64))
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        file.write_all(&buffer)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        self.entries
            .write()
            .insert(offset.value(), IndexEntry { position, size });

        Ok(())
    }

    /// Lookup an offset, returning `(position, size)`.
    pub fn lookup(&self, offset: Offset) -> Option<(u64, u32)> {
        self.entries
            .read()
            .get(&offset.value())
            .map(|entry| (entry.position, entry.size))
    }

    /// Highest offset present in the index.
    pub fn last_offset(&self) -> Option<u64> {
        self.entries.read().keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove all entries at or beyond `offset`, cutting the file to match.
    /// Returns the segment position of the first removed entry, if any.
    pub fn truncate_from(&self, offset: u64) -> Result<Option<u64>> {
        let mut entries = self.entries.write();

        let cut_position = entries.range(offset..).next().map(|(_, e)| e.position);
        if cut_position.is_none() {
            return Ok(None);
        }

        entries.retain(|&o, _| o < offset);
        let retained = entries.len() as u64;

        let file = self.file.write();
        file.set_len(retained * INDEX_ENTRY_SIZE as u64)
            .map_err(|e| StreambedError::Storage(e.to_string()))?;

        Ok(cut_position)
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.read();
        file.sync_all()
            .map_err(|e| StreambedError::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
