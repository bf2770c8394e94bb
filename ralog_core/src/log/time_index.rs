//! A time index file contains a sequence of 12-byte entries:
//! - (8 bytes) timestamp of a message, big-endian.
//! - (4 bytes) offset of a message with a timestamp at least that large,
//!   relative to the base offset, big-endian.
//!
//! Entries carry strictly increasing timestamps and non-decreasing offsets;
//! a lookup answers the greatest indexed timestamp at most the target so the
//! host can turn a point in time into an offset to start consuming from.

use super::abstract_index::{
    relative_offset, AbstractIndex, IndexCodec, IndexError, IndexRecord, SearchKind,
};
use std::path::{Path, PathBuf};

/// On-disk size of one time index entry.
pub const ENTRY_SIZE: usize = 12;

/// Timestamp of a lookup that found no entry.
pub const UNKNOWN_TIMESTAMP: i64 = -1;

/// A decoded time index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampOffset {
    pub timestamp: i64,
    pub offset: i64,
}

impl IndexRecord for TimestampOffset {
    fn index_key(&self) -> i64 {
        self.timestamp
    }

    fn index_value(&self) -> i64 {
        self.offset
    }
}

#[derive(Debug)]
pub(crate) struct TimeIndexCodec;

impl IndexCodec for TimeIndexCodec {
    type Record = TimestampOffset;

    const ENTRY_SIZE: usize = ENTRY_SIZE;

    fn parse_entry(buf: &[u8], base_offset: i64, slot: usize) -> TimestampOffset {
        let at = slot * ENTRY_SIZE;
        let timestamp = i64::from_be_bytes([
            buf[at],
            buf[at + 1],
            buf[at + 2],
            buf[at + 3],
            buf[at + 4],
            buf[at + 5],
            buf[at + 6],
            buf[at + 7],
        ]);
        let relative_offset =
            u32::from_be_bytes([buf[at + 8], buf[at + 9], buf[at + 10], buf[at + 11]]);
        TimestampOffset { timestamp, offset: base_offset + i64::from(relative_offset) }
    }
}

/// Maps message timestamps to logical offsets in a segment.
#[derive(Debug)]
pub struct TimeIndex {
    inner: AbstractIndex<TimeIndexCodec>,
}

impl TimeIndex {
    /// Opens the index at `file`, creating and pre-allocating it when absent.
    /// `max_index_size` defaults to
    /// [`DEFAULT_MAX_INDEX_SIZE`](super::abstract_index::DEFAULT_MAX_INDEX_SIZE)
    /// and `writable` to true.
    pub fn new(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: Option<bool>,
    ) -> Result<Self, IndexError> {
        Ok(Self { inner: AbstractIndex::new(file, base_offset, max_index_size, writable)? })
    }

    /// The entry for the greatest indexed timestamp at most
    /// `target_timestamp`, or `(UNKNOWN_TIMESTAMP, base_offset)` when every
    /// indexed timestamp is above the target.
    pub fn lookup(&self, target_timestamp: i64) -> Result<TimestampOffset, IndexError> {
        Ok(self.inner.largest_lower_bound_entry(target_timestamp, SearchKind::Key)?.unwrap_or(
            TimestampOffset { timestamp: UNKNOWN_TIMESTAMP, offset: self.inner.base_offset() },
        ))
    }

    /// Appends `(timestamp, offset)` when `timestamp` is strictly greater
    /// than the last indexed one; an equal timestamp is skipped silently. A
    /// smaller timestamp or a smaller offset fails: either would break the
    /// search order. `skip_full_check` admits the closing entry written while
    /// a segment rolls.
    pub fn maybe_append(
        &self,
        timestamp: i64,
        offset: i64,
        skip_full_check: bool,
    ) -> Result<(), IndexError> {
        let mut state = self.inner.lock_state();
        self.inner.check_appendable(&state, skip_full_check)?;
        if let Some(last) = state.last_entry {
            if offset < last.offset {
                return Err(IndexError::InvalidOffset(offset, last.offset));
            }
            if timestamp < last.timestamp {
                return Err(IndexError::InvalidTimestamp(timestamp, last.timestamp));
            }
            if timestamp == last.timestamp {
                return Ok(());
            }
        }
        let relative = relative_offset(self.inner.base_offset(), offset)?;
        let mut entry = [0u8; ENTRY_SIZE];
        entry[..8].copy_from_slice(&timestamp.to_be_bytes());
        entry[8..].copy_from_slice(&relative.to_be_bytes());
        self.inner.append_entry_bytes(&mut state, &entry, TimestampOffset { timestamp, offset })
    }

    /// Removes all entries.
    pub fn truncate(&self) -> Result<(), IndexError> {
        self.inner.truncate()
    }

    /// Removes every entry whose offset is at or above `offset`.
    pub fn truncate_to(&self, offset: i64) -> Result<(), IndexError> {
        self.inner.truncate_to_target(offset, SearchKind::Value)
    }

    /// Entry at `slot` within the live prefix.
    pub fn entry(&self, slot: usize) -> Result<Option<TimestampOffset>, IndexError> {
        self.inner.entry(slot)
    }

    /// The last appended entry, or `(UNKNOWN_TIMESTAMP, base_offset)` for an
    /// empty index.
    pub fn last_entry(&self) -> TimestampOffset {
        self.inner.last_entry().unwrap_or(TimestampOffset {
            timestamp: UNKNOWN_TIMESTAMP,
            offset: self.inner.base_offset(),
        })
    }

    /// Fails with `CorruptIndex` when the file length is not a multiple of
    /// the entry size or when the live prefix does not carry strictly
    /// increasing timestamps.
    pub fn sanity_check(&self) -> Result<(), IndexError> {
        if let Some(last) = self.inner.last_entry() {
            if last.offset < self.inner.base_offset() {
                return Err(IndexError::CorruptIndex(
                    self.inner.file_path().display().to_string(),
                    format!(
                        "last offset {} is smaller than the base offset {}",
                        last.offset,
                        self.inner.base_offset()
                    ),
                ));
            }
        }
        self.inner.sanity_check_core()
    }

    /// Forces dirty pages of the mapping to disk.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.inner.flush()
    }

    /// Resizes the backing file to the largest entry multiple not exceeding
    /// `new_size`; returns whether the length changed.
    pub fn resize(&self, new_size: usize) -> Result<bool, IndexError> {
        self.inner.resize(new_size)
    }

    /// Trims the backing file to exactly the live entries.
    pub fn trim_to_valid_size(&self) -> Result<bool, IndexError> {
        self.inner.trim_to_valid_size()
    }

    /// Seals the index: trims the file and remaps it read-only.
    pub fn make_read_only(&self) -> Result<(), IndexError> {
        self.inner.make_read_only()
    }

    /// Flushes, trims a writable file to its live entries, and releases the
    /// mapping and file handle. Idempotent.
    pub fn close(&self) -> Result<(), IndexError> {
        self.inner.close()
    }

    /// Closes the index and removes its backing file.
    pub fn delete_if_exists(&self) -> Result<bool, IndexError> {
        self.inner.delete_if_exists()
    }

    /// Renames the backing file in place.
    pub fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError> {
        self.inner.rename_to(new_path)
    }

    /// Re-homes the index path after the owning directory moved.
    pub fn update_parent_dir(&self, parent_dir: &Path) {
        self.inner.update_parent_dir(parent_dir)
    }

    pub fn base_offset(&self) -> i64 {
        self.inner.base_offset()
    }

    pub fn entries(&self) -> usize {
        self.inner.entries()
    }

    pub fn max_entries(&self) -> usize {
        self.inner.max_entries()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    pub fn file_path(&self) -> PathBuf {
        self.inner.file_path()
    }
}
