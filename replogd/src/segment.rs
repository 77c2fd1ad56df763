//! A single segment of a [`crate::log::Log`]
//!
//! Every segment is a pair of files:
//!
//! * store file (`{base_offset:020}.store`) - records, each prefixed with
//!   its length as a big endian `u64`,
//! * index file (`{base_offset:020}.index`) - fixed size [`IndexEntry`]s,
//!   one per record, pointing at the record position in the store file.
//!
//! Reads are positional (`pread`) and never block on the writer. The
//! number of records visible to readers is published only after both
//! the store and the index were written.
use std::{
    fs::{File, OpenOptions},
    io::Cursor,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use binrw::{io::NoSeek, BinRead, BinWrite};
use convi::ExpectFrom;
use replog_api::LogOffset;
use tracing::{debug, trace, warn};

use crate::log::{LogConfig, LogError, LogResult};

/// Length prefix of every record in a store file
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct RecordLen(pub u64);

impl RecordLen {
    pub const BYTE_SIZE: usize = 8;
    pub const BYTE_SIZE_U64: u64 = 8;
}

/// Entry of an index file
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct IndexEntry {
    /// Offset of the record, relative to the segment base offset
    pub relative_offset: u32,
    /// Position of the record (its length prefix) in the store file
    pub position: u64,
}

impl IndexEntry {
    pub const BYTE_SIZE: usize = 4 + 8;
    pub const BYTE_SIZE_U64: u64 = 4 + 8;
}

#[derive(Debug)]
pub struct Segment {
    base_offset: LogOffset,
    store_path: PathBuf,
    index_path: PathBuf,
    store: File,
    index: File,
    /// Number of records visible to readers
    len: AtomicU64,
    /// Size of the store file content visible to readers
    store_size: AtomicU64,
    max_store_bytes: u64,
    max_index_bytes: u64,
}

impl Segment {
    pub const STORE_EXTENSION: &'static str = "store";
    pub const INDEX_EXTENSION: &'static str = "index";

    pub fn store_path(dir: &Path, base_offset: LogOffset) -> PathBuf {
        dir.join(format!("{:020}.{}", base_offset.as_u64(), Self::STORE_EXTENSION))
    }

    pub fn index_path(dir: &Path, base_offset: LogOffset) -> PathBuf {
        dir.join(format!("{:020}.{}", base_offset.as_u64(), Self::INDEX_EXTENSION))
    }

    /// Open (creating if needed) a segment starting at `base_offset`
    ///
    /// Anything at the end of the files that does not form a complete
    /// record with a matching index entry is truncated away.
    pub fn open(dir: &Path, base_offset: LogOffset, config: &LogConfig) -> LogResult<Self> {
        let store_path = Self::store_path(dir, base_offset);
        let index_path = Self::index_path(dir, base_offset);
        trace!(path = %store_path.display(), "Opening segment");

        let store = open_rw(&store_path)?;
        let index = open_rw(&index_path)?;

        let store_file_len = store.metadata()?.len();
        let index_file_len = index.metadata()?.len();

        let mut len = index_file_len / IndexEntry::BYTE_SIZE_U64;
        let mut store_size = 0;

        while 0 < len {
            let entry = read_index_entry(&index, len - 1)?;
            if u64::from(entry.relative_offset) == len - 1 {
                if let Some(end) = record_end(&store, entry.position, store_file_len)? {
                    store_size = end;
                    break;
                }
            }
            len -= 1;
        }

        if index_file_len != len * IndexEntry::BYTE_SIZE_U64 {
            warn!(
                path = %index_path.display(),
                from_size = index_file_len,
                to_size = len * IndexEntry::BYTE_SIZE_U64,
                "truncating index file"
            );
            index.set_len(len * IndexEntry::BYTE_SIZE_U64)?;
        }

        if store_file_len != store_size {
            warn!(
                path = %store_path.display(),
                from_size = store_file_len,
                to_size = store_size,
                "truncating store file"
            );
            store.set_len(store_size)?;
        }

        debug!(
            %base_offset,
            len,
            store_size,
            "segment opened"
        );

        Ok(Self {
            base_offset,
            store_path,
            index_path,
            store,
            index,
            len: AtomicU64::new(len),
            store_size: AtomicU64::new(store_size),
            max_store_bytes: config.max_store_bytes,
            max_index_bytes: config.max_index_bytes,
        })
    }

    pub fn base_offset(&self) -> LogOffset {
        self.base_offset
    }

    /// Number of records in this segment
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The offset the next appended record will get
    pub fn next_offset(&self) -> LogOffset {
        self.base_offset + self.len()
    }

    pub fn store_size(&self) -> u64 {
        self.store_size.load(Ordering::Acquire)
    }

    /// Did the store or the index reach the configured size
    pub fn is_maxed(&self) -> bool {
        self.max_store_bytes <= self.store_size()
            || self.max_index_bytes <= self.len() * IndexEntry::BYTE_SIZE_U64
    }

    /// Append a record, returning its offset
    ///
    /// Callers must serialize all calls modifying the segment.
    pub fn append(&self, record: &[u8]) -> LogResult<LogOffset> {
        let len = self.len.load(Ordering::Acquire);
        let position = self.store_size.load(Ordering::Acquire);

        let mut buf = Vec::with_capacity(RecordLen::BYTE_SIZE + record.len());
        RecordLen(u64::expect_from(record.len()))
            .write(&mut NoSeek::new(&mut buf))
            .expect("can't fail");
        buf.extend_from_slice(record);
        self.store.write_all_at(&buf, position)?;

        let mut entry_buf = [0u8; IndexEntry::BYTE_SIZE];
        IndexEntry {
            relative_offset: u32::expect_from(len),
            position,
        }
        .write(&mut Cursor::new(&mut entry_buf[..]))
        .expect("can't fail");
        self.index
            .write_all_at(&entry_buf, len * IndexEntry::BYTE_SIZE_U64)?;

        self.store_size
            .store(position + u64::expect_from(buf.len()), Ordering::Release);
        self.len.store(len + 1, Ordering::Release);

        Ok(self.base_offset + len)
    }

    fn relative(&self, offset: LogOffset) -> LogResult<u64> {
        if offset < self.base_offset || self.len() <= offset - self.base_offset {
            return Err(LogError::OffsetNotFound(offset));
        }
        Ok(offset - self.base_offset)
    }

    /// Read a record
    pub fn read(&self, offset: LogOffset) -> LogResult<Vec<u8>> {
        let entry = read_index_entry(&self.index, self.relative(offset)?)?;

        let mut len_buf = [0u8; RecordLen::BYTE_SIZE];
        self.store.read_exact_at(&mut len_buf, entry.position)?;
        let len = RecordLen::read(&mut Cursor::new(&len_buf[..]))
            .map_err(|e| LogError::Corrupted(e.to_string()))?;

        let record_start = entry.position + RecordLen::BYTE_SIZE_U64;
        if self.store_size() < record_start + len.0 {
            return Err(LogError::Corrupted(format!(
                "record {offset} exceeds the store file"
            )));
        }

        let mut record = vec![0u8; usize::expect_from(len.0)];
        self.store.read_exact_at(&mut record, record_start)?;
        Ok(record)
    }

    /// Position in the store file where the record at `offset` starts
    ///
    /// For `offset == next_offset()` returns the end of the store.
    pub fn store_position(&self, offset: LogOffset) -> LogResult<u64> {
        if offset == self.next_offset() {
            return Ok(self.store_size());
        }
        let entry = read_index_entry(&self.index, self.relative(offset)?)?;
        Ok(entry.position)
    }

    /// Read raw store content (records with their length prefixes)
    pub fn read_store_at(&self, buf: &mut [u8], position: u64) -> std::io::Result<usize> {
        self.store.read_at(buf, position)
    }

    /// Drop all records `>= offset`
    ///
    /// Callers must serialize all calls modifying the segment.
    pub fn truncate_from(&self, offset: LogOffset) -> LogResult<()> {
        let rel = if offset < self.base_offset {
            0
        } else {
            offset - self.base_offset
        };
        let len = self.len();
        if len <= rel {
            return Ok(());
        }

        let position = read_index_entry(&self.index, rel)?.position;

        // Hide the records before touching the files
        self.len.store(rel, Ordering::Release);
        self.store_size.store(position, Ordering::Release);

        self.index.set_len(rel * IndexEntry::BYTE_SIZE_U64)?;
        self.store.set_len(position)?;

        debug!(
            base_offset = %self.base_offset,
            from_len = len,
            to_len = rel,
            "segment truncated"
        );
        Ok(())
    }

    /// Make all appended data durable
    pub fn flush(&self) -> LogResult<()> {
        self.store.sync_data()?;
        self.index.sync_data()?;
        Ok(())
    }

    /// Flush and close the segment
    pub fn close(self) -> LogResult<()> {
        self.flush()
    }

    /// Delete files of this segment
    ///
    /// Already opened file handles stay usable until dropped, so readers
    /// still holding the segment can finish.
    pub fn remove(&self) -> LogResult<()> {
        debug!(base_offset = %self.base_offset, "removing segment");
        std::fs::remove_file(&self.store_path)?;
        std::fs::remove_file(&self.index_path)?;
        Ok(())
    }
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

fn read_index_entry(index: &File, relative_offset: u64) -> LogResult<IndexEntry> {
    let mut buf = [0u8; IndexEntry::BYTE_SIZE];
    index.read_exact_at(&mut buf, relative_offset * IndexEntry::BYTE_SIZE_U64)?;
    IndexEntry::read(&mut Cursor::new(&buf[..])).map_err(|e| LogError::Corrupted(e.to_string()))
}

/// End position of a record starting at `position`, if it's fully contained in the file
fn record_end(store: &File, position: u64, file_len: u64) -> LogResult<Option<u64>> {
    if file_len < position + RecordLen::BYTE_SIZE_U64 {
        return Ok(None);
    }
    let mut len_buf = [0u8; RecordLen::BYTE_SIZE];
    store.read_exact_at(&mut len_buf, position)?;
    let len = u64::from_be_bytes(len_buf);

    let end = position
        .checked_add(RecordLen::BYTE_SIZE_U64)
        .and_then(|p| p.checked_add(len));
    Ok(end.filter(|end| *end <= file_len))
}
