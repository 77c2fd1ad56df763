//! Segmented, append-only log
//!
//! A [`Log`] is an ordered list of [`Segment`]s with contiguous, non
//! overlapping offset ranges. Only the last (active) segment is written
//! to; once it reaches the configured size a new one is started.
use std::{
    cmp,
    collections::BTreeMap,
    io,
    ops::Bound,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use convi::ExpectFrom;
use replog_api::{LogOffset, RecordSize};
use thiserror::Error;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::segment::{RecordLen, Segment};

#[derive(Error, Debug)]
pub enum LogError {
    #[error("offset {0} not found")]
    OffsetNotFound(LogOffset),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupted log: {0}")]
    Corrupted(String),
    #[error("invalid file path: {}", path.display())]
    InvalidFilePath { path: PathBuf },
}

pub type LogResult<T> = std::result::Result<T, LogError>;

#[derive(TypedBuilder, Debug, Clone, Copy)]
pub struct LogConfig {
    /// Start a new segment after the store file reached this size
    #[builder(default = LogConfig::DEFAULT_MAX_STORE_BYTES)]
    pub max_store_bytes: u64,
    /// Start a new segment after the index file reached this size
    #[builder(default = LogConfig::DEFAULT_MAX_INDEX_BYTES)]
    pub max_index_bytes: u64,
    /// Offset of the first record of a brand new log
    #[builder(default)]
    pub initial_offset: LogOffset,
    /// Drop the oldest segments once all store files together are larger
    #[builder(default)]
    pub max_log_bytes: Option<u64>,
}

impl LogConfig {
    pub const DEFAULT_MAX_STORE_BYTES: u64 = 16 * 1024 * 1024;
    pub const DEFAULT_MAX_INDEX_BYTES: u64 = 1024 * 1024;
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    /// All segments, by base offset; never empty
    ///
    /// The lock is only for adding/removing segments. Segments
    /// themselves are `Arc`ed, so readers can clone them out and
    /// do the IO without holding it.
    segments: RwLock<BTreeMap<LogOffset, Arc<Segment>>>,
    /// Serializes everything that modifies the log
    write_lock: Mutex<()>,
}

impl Log {
    /// Open the log stored in `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> LogResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut bases = scan_segments(&dir)?;
        bases.sort();

        let mut segments: BTreeMap<LogOffset, Arc<Segment>> = BTreeMap::new();
        for base in bases {
            let segment = Segment::open(&dir, base, &config)?;
            if let Some((_, prev)) = segments.last_key_value() {
                if prev.next_offset() != base {
                    return Err(LogError::Corrupted(format!(
                        "segment {} does not follow segment ending at {}",
                        base,
                        prev.next_offset()
                    )));
                }
            }
            segments.insert(base, Arc::new(segment));
        }

        if segments.is_empty() {
            info!(dir = %dir.display(), "No existing log segments found");
            let segment = Segment::open(&dir, config.initial_offset, &config)?;
            segments.insert(config.initial_offset, Arc::new(segment));
        } else {
            let first = segments.values().next().expect("not empty");
            let last = segments.values().next_back().expect("not empty");
            info!(
                dir = %dir.display(),
                lowest_offset = %first.base_offset(),
                next_offset = %last.next_offset(),
                num_segments = segments.len(),
                "Segments loaded"
            );
        }

        Ok(Self {
            dir,
            config,
            segments: RwLock::new(segments),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active(&self) -> Arc<Segment> {
        self.segments
            .read()
            .expect("Locking failed")
            .values()
            .next_back()
            .cloned()
            .expect("log always has an active segment")
    }

    fn containing(&self, offset: LogOffset) -> Option<Arc<Segment>> {
        self.segments
            .read()
            .expect("Locking failed")
            .range(..=offset)
            .next_back()
            .map(|(_, s)| s.clone())
    }

    /// Append a record, returning its offset
    pub fn append(&self, record: &[u8]) -> LogResult<LogOffset> {
        let _write = self.write_lock.lock().expect("Locking failed");

        let active = self.active();
        let offset = active.append(record)?;

        if active.is_maxed() {
            active.flush()?;
            let next = offset.next();
            let segment = Arc::new(Segment::open(&self.dir, next, &self.config)?);
            debug!(base_offset = %next, "new active segment");
            self.segments
                .write()
                .expect("Locking failed")
                .insert(next, segment);
        }

        Ok(offset)
    }

    /// Read the record at `offset`
    pub fn read(&self, offset: LogOffset) -> LogResult<Vec<u8>> {
        self.containing(offset)
            .ok_or(LogError::OffsetNotFound(offset))?
            .read(offset)
    }

    /// Lowest offset still retained
    pub fn lowest_offset(&self) -> LogOffset {
        self.segments
            .read()
            .expect("Locking failed")
            .keys()
            .next()
            .copied()
            .expect("log always has an active segment")
    }

    /// The offset the next appended record will get
    pub fn next_offset(&self) -> LogOffset {
        self.active().next_offset()
    }

    /// Offset of the last record, if there is any
    pub fn highest_offset(&self) -> Option<LogOffset> {
        let next = self.next_offset();
        (self.lowest_offset() < next).then(|| next.prev())
    }

    /// Make all appended records durable
    pub fn flush(&self) -> LogResult<()> {
        self.active().flush()
    }

    /// Remove all segments with every record `< lowest`
    ///
    /// The active segment is never removed.
    pub fn truncate(&self, lowest: LogOffset) -> LogResult<()> {
        let _write = self.write_lock.lock().expect("Locking failed");

        let removed: Vec<_> = {
            let mut segments = self.segments.write().expect("Locking failed");
            let active_base = *segments.keys().next_back().expect("not empty");
            let to_remove: Vec<_> = segments
                .iter()
                .filter(|(base, s)| **base != active_base && s.next_offset() <= lowest)
                .map(|(base, _)| *base)
                .collect();
            to_remove
                .iter()
                .filter_map(|base| segments.remove(base))
                .collect()
        };

        for segment in &removed {
            segment.remove()?;
        }
        debug!(%lowest, removed = removed.len(), "log truncated");
        Ok(())
    }

    /// Drop the oldest sealed segments beyond the `max_log_bytes` budget
    ///
    /// Returns the new lowest offset, if anything was removed.
    pub fn enforce_retention(&self) -> LogResult<Option<LogOffset>> {
        let Some(max_log_bytes) = self.config.max_log_bytes else {
            return Ok(None);
        };

        let lowest = {
            let segments = self.segments.read().expect("Locking failed");
            let mut total: u64 = segments.values().map(|s| s.store_size()).sum();
            let mut lowest = None;
            // the last (active) segment is never a candidate
            for segment in segments.values().take(segments.len().saturating_sub(1)) {
                if total <= max_log_bytes {
                    break;
                }
                total -= segment.store_size();
                lowest = Some(segment.next_offset());
            }
            lowest
        };

        if let Some(lowest) = lowest {
            self.truncate(lowest)?;
            info!(dir = %self.dir.display(), %lowest, "Old records dropped");
        }
        Ok(lowest)
    }

    /// Remove all records `>= offset`
    pub fn truncate_suffix(&self, offset: LogOffset) -> LogResult<()> {
        let _write = self.write_lock.lock().expect("Locking failed");

        let removed: Vec<_> = {
            let mut segments = self.segments.write().expect("Locking failed");
            let containing = *segments
                .range(..=offset)
                .next_back()
                .ok_or(LogError::OffsetNotFound(offset))?
                .0;
            let after: Vec<_> = segments
                .range((Bound::Excluded(containing), Bound::Unbounded))
                .map(|(base, _)| *base)
                .collect();
            after
                .iter()
                .filter_map(|base| segments.remove(base))
                .collect()
        };

        for segment in &removed {
            segment.remove()?;
        }

        self.active().truncate_from(offset)
    }

    /// Drop all records and start over at `initial_offset`
    pub fn reset(&self, initial_offset: LogOffset) -> LogResult<()> {
        let _write = self.write_lock.lock().expect("Locking failed");
        let mut segments = self.segments.write().expect("Locking failed");

        for segment in segments.values() {
            segment.remove()?;
        }
        let segment = Arc::new(Segment::open(&self.dir, initial_offset, &self.config)?);
        *segments = BTreeMap::from([(initial_offset, segment)]);

        info!(dir = %self.dir.display(), %initial_offset, "log reset");
        Ok(())
    }

    /// Replace the whole content of the log with records read from `reader`
    ///
    /// `reader` must yield the format produced by [`LogReader`]. Returns
    /// the new `next_offset`.
    pub fn restore(
        &self,
        initial_offset: LogOffset,
        mut reader: impl io::Read,
    ) -> LogResult<LogOffset> {
        self.reset(initial_offset)?;
        while let Some(record) = read_record(&mut reader)? {
            self.append(&record)?;
        }
        self.flush()?;
        Ok(self.next_offset())
    }

    /// Reader over all records currently in the log
    pub fn reader(&self) -> LogResult<LogReader> {
        self.reader_until(self.next_offset())
    }

    /// Reader over all retained records `< end`
    pub fn reader_until(&self, end: LogOffset) -> LogResult<LogReader> {
        let segments: Vec<_> = self
            .segments
            .read()
            .expect("Locking failed")
            .values()
            .cloned()
            .collect();

        let next_offset = segments
            .last()
            .map(|s| s.next_offset())
            .expect("not empty");
        if next_offset < end {
            return Err(LogError::OffsetNotFound(end));
        }

        let base_offset = segments.first().map(|s| s.base_offset()).expect("not empty");
        let mut parts = vec![];
        for segment in segments {
            if end <= segment.base_offset() {
                break;
            }
            let part_end = if end < segment.next_offset() {
                segment.store_position(end)?
            } else {
                segment.store_size()
            };
            parts.push((segment, part_end));
        }

        Ok(LogReader {
            base_offset,
            end_offset: cmp::max(end, base_offset),
            parts,
            current: 0,
            position: 0,
        })
    }

    /// Sync and close
    pub fn close(self) -> LogResult<()> {
        for segment in self.segments.read().expect("Locking failed").values() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Close and remove all the files
    pub fn remove(self) -> LogResult<()> {
        let dir = self.dir.clone();
        self.close()?;
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}

/// Lazy, restartable reader over the raw content of a [`Log`]
///
/// Yields length-prefixed records (see [`RecordLen`]) of a fixed range of
/// offsets, captured when the reader was created.
#[derive(Debug)]
pub struct LogReader {
    base_offset: LogOffset,
    end_offset: LogOffset,
    /// Segments and the store position to read each of them up to
    parts: Vec<(Arc<Segment>, u64)>,
    current: usize,
    position: u64,
}

impl LogReader {
    /// Offset of the first record yielded
    pub fn base_offset(&self) -> LogOffset {
        self.base_offset
    }

    /// Offset right after the last record yielded
    pub fn end_offset(&self) -> LogOffset {
        self.end_offset
    }

    /// Total number of bytes the reader yields
    pub fn byte_len(&self) -> u64 {
        self.parts.iter().map(|(_, end)| end).sum()
    }

    /// Start from the beginning again
    pub fn rewind(&mut self) {
        self.current = 0;
        self.position = 0;
    }
}

impl io::Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some((segment, end)) = self.parts.get(self.current) {
            if self.position < *end {
                let max = usize::expect_from(cmp::min(
                    u64::expect_from(buf.len()),
                    end - self.position,
                ));
                let n = segment.read_store_at(&mut buf[..max], self.position)?;
                if n == 0 && max != 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                self.position += u64::expect_from(n);
                return Ok(n);
            }
            self.current += 1;
            self.position = 0;
        }
        Ok(0)
    }
}

/// Read a single length-prefixed record, `None` on a clean end of input
pub fn read_record(reader: &mut impl io::Read) -> LogResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; RecordLen::BYTE_SIZE];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(LogError::Corrupted("truncated record length".into()));
        }
        filled += n;
    }

    let len = u64::from_be_bytes(len_buf);
    if u64::from(RecordSize::MAX) < len {
        return Err(LogError::Corrupted(format!("record length {len} too large")));
    }
    let mut record = vec![0u8; usize::expect_from(len)];
    reader.read_exact(&mut record).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => LogError::Corrupted("truncated record".into()),
        _ => LogError::Io(e),
    })?;
    Ok(Some(record))
}

/// Find base offsets of all the segments in `dir`
fn scan_segments(dir: &Path) -> LogResult<Vec<LogOffset>> {
    let mut bases = vec![];

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();

        if path.extension().and_then(|e| e.to_str()) != Some(Segment::STORE_EXTENSION) {
            debug!(path = %path.display(), "Ignoring non-store file");
            continue;
        }

        let base = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| s.len() == 20)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| LogError::InvalidFilePath { path: path.clone() })?;

        bases.push(LogOffset(base));
    }

    Ok(bases)
}
