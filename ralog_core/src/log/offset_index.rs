//! An offset index file contains a sequence of 8-byte entries:
//! - (4 bytes) offset of a message, relative to the base offset, big-endian.
//! - (4 bytes) physical byte position of that message in the segment file,
//!   big-endian.
//!
//! The index is sparse: the host appends an entry every few kilobytes of log
//! data, so a lookup answers the greatest indexed offset at most the target
//! and the reader scans the segment forward from that position. The file is
//! pre-allocated to its maximum size and memory-mapped; only the strictly
//! increasing prefix validated at open time is live.

use super::abstract_index::{
    relative_offset, AbstractIndex, IndexCodec, IndexError, IndexRecord, SearchKind,
};
use std::path::{Path, PathBuf};

/// On-disk size of one offset index entry.
pub const ENTRY_SIZE: usize = 8;

/// A decoded offset index entry: an absolute message offset and the physical
/// byte position of that message in the paired segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPosition {
    pub offset: i64,
    pub position: u32,
}

impl IndexRecord for OffsetPosition {
    fn index_key(&self) -> i64 {
        self.offset
    }

    fn index_value(&self) -> i64 {
        i64::from(self.position)
    }
}

#[derive(Debug)]
pub(crate) struct OffsetIndexCodec;

impl IndexCodec for OffsetIndexCodec {
    type Record = OffsetPosition;

    const ENTRY_SIZE: usize = ENTRY_SIZE;

    fn parse_entry(buf: &[u8], base_offset: i64, slot: usize) -> OffsetPosition {
        let at = slot * ENTRY_SIZE;
        let relative_offset = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let position = u32::from_be_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
        OffsetPosition { offset: base_offset + i64::from(relative_offset), position }
    }
}

/// Maps logical message offsets to physical positions in a segment file.
#[derive(Debug)]
pub struct OffsetIndex {
    inner: AbstractIndex<OffsetIndexCodec>,
}

impl OffsetIndex {
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

    /// Physical location of the message with the greatest indexed offset at
    /// most `target_offset`, or `(base_offset, 0)` when every indexed offset
    /// is above the target. The caller scans the segment forward from the
    /// returned position.
    pub fn lookup(&self, target_offset: i64) -> Result<OffsetPosition, IndexError> {
        Ok(self
            .inner
            .largest_lower_bound_entry(target_offset, SearchKind::Key)?
            .unwrap_or(OffsetPosition { offset: self.inner.base_offset(), position: 0 }))
    }

    /// The first entry whose physical position is at least
    /// `fetch_offset.position + fetch_size`, or `None` when no indexed
    /// position reaches that far. The host uses it to cap a fetch so that it
    /// ends on an indexed boundary past the requested byte range.
    pub fn fetch_upper_bound_offset(
        &self,
        fetch_offset: OffsetPosition,
        fetch_size: u32,
    ) -> Result<Option<OffsetPosition>, IndexError> {
        let target_position = i64::from(fetch_offset.position) + i64::from(fetch_size);
        self.inner.smallest_upper_bound_entry(target_position, SearchKind::Value)
    }

    /// Appends an entry for `offset` at `position`. Offsets must arrive in
    /// strictly increasing order and within the 32-bit relative range of the
    /// base offset.
    pub fn append(&self, offset: i64, position: u32) -> Result<(), IndexError> {
        let mut state = self.inner.lock_state();
        self.inner.check_appendable(&state, false)?;
        if let Some(last) = state.last_entry {
            if offset <= last.offset {
                return Err(IndexError::InvalidOffset(offset, last.offset));
            }
        }
        let relative = relative_offset(self.inner.base_offset(), offset)?;
        let mut entry = [0u8; ENTRY_SIZE];
        entry[..4].copy_from_slice(&relative.to_be_bytes());
        entry[4..].copy_from_slice(&position.to_be_bytes());
        self.inner.append_entry_bytes(&mut state, &entry, OffsetPosition { offset, position })
    }

    /// Removes all entries.
    pub fn truncate(&self) -> Result<(), IndexError> {
        self.inner.truncate()
    }

    /// Removes every entry with an offset at or above `offset`.
    pub fn truncate_to(&self, offset: i64) -> Result<(), IndexError> {
        self.inner.truncate_to_target(offset, SearchKind::Key)
    }

    /// Entry at `slot` within the live prefix.
    pub fn entry(&self, slot: usize) -> Result<Option<OffsetPosition>, IndexError> {
        self.inner.entry(slot)
    }

    /// Fails with `CorruptIndex` when the file length is not a multiple of
    /// the entry size, when the last offset precedes the base offset, or
    /// when the live prefix is not strictly increasing.
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

    /// Offset of the last entry, or the base offset when the index is empty.
    pub fn last_offset(&self) -> i64 {
        self.inner.last_entry().map_or(self.inner.base_offset(), |entry| entry.offset)
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

    pub fn max_index_size(&self) -> usize {
        self.inner.max_index_size()
    }

    pub fn file_path(&self) -> PathBuf {
        self.inner.file_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::offset_index_file;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Once};
    use std::thread;
    use tempfile::TempDir;

    static INIT_TRACING: Once = Once::new();

    fn init_tracing() {
        INIT_TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }

    fn new_index(dir: &TempDir, base_offset: i64, max_index_size: usize) -> OffsetIndex {
        init_tracing();
        OffsetIndex::new(
            offset_index_file(dir.path(), base_offset),
            base_offset,
            Some(max_index_size),
            None,
        )
        .unwrap()
    }

    fn write_raw_entries(path: &Path, entries: &[(u32, u32)], pad_to: usize) {
        let mut bytes = Vec::new();
        for (relative, position) in entries {
            bytes.extend_from_slice(&relative.to_be_bytes());
            bytes.extend_from_slice(&position.to_be_bytes());
        }
        if bytes.len() < pad_to {
            bytes.resize(pad_to, 0);
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn entry(offset: i64, position: u32) -> OffsetPosition {
        OffsetPosition { offset, position }
    }

    #[test]
    fn it_answers_the_base_sentinel_on_an_empty_index() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        assert_eq!(index.entries(), 0);
        assert_eq!(index.last_offset(), 50);
        assert_eq!(index.lookup(100).unwrap(), entry(50, 0));
        assert_eq!(index.fetch_upper_bound_offset(entry(50, 0), 1024).unwrap(), None);
    }

    #[test]
    fn it_looks_up_a_single_entry() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 128).unwrap();
        assert_eq!(index.lookup(55).unwrap(), entry(55, 128));
        assert_eq!(index.lookup(60).unwrap(), entry(55, 128));
        assert_eq!(index.lookup(54).unwrap(), entry(50, 0));
    }

    #[test]
    fn it_walks_a_monotonic_index() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        assert_eq!(index.lookup(80).unwrap(), entry(70, 4096));
        assert_eq!(index.lookup(95).unwrap(), entry(95, 8192));
        assert_eq!(index.lookup(200).unwrap(), entry(95, 8192));
        assert_eq!(index.last_offset(), 95);
    }

    #[test]
    fn it_rejects_a_non_increasing_append() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        match index.append(70, 12000) {
            Err(IndexError::InvalidOffset(offset, last)) => {
                assert_eq!(offset, 70);
                assert_eq!(last, 95);
            },
            other => panic!("expected InvalidOffset, got {:?}", other),
        }
        // a failed append leaves the index untouched
        assert_eq!(index.entries(), 3);
        assert_eq!(index.lookup(80).unwrap(), entry(70, 4096));
    }

    #[test]
    fn it_rejects_an_offset_outside_the_relative_range() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 0, 8 * 1024);
        match index.append(1 << 32, 0) {
            Err(IndexError::OffsetOverflow(offset, base)) => {
                assert_eq!(offset, 1 << 32);
                assert_eq!(base, 0);
            },
            other => panic!("expected OffsetOverflow, got {:?}", other),
        }
        assert_eq!(index.entries(), 0);
    }

    #[test]
    fn it_rejects_appends_below_the_base_offset() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        assert!(matches!(index.append(49, 0), Err(IndexError::OffsetOverflow(49, 50))));
    }

    #[test]
    fn it_fails_with_index_full_at_capacity() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 2 * ENTRY_SIZE);
        assert_eq!(index.max_entries(), 2);
        index.append(55, 0).unwrap();
        index.append(60, 512).unwrap();
        assert!(index.is_full());
        assert!(matches!(index.append(65, 1024), Err(IndexError::IndexFull(2))));
    }

    #[test]
    fn it_drops_the_matching_entry_on_an_exact_truncate_hit() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        index.truncate_to(70).unwrap();
        assert_eq!(index.entries(), 1);
        assert_eq!(index.last_offset(), 55);
        assert_eq!(index.lookup(90).unwrap(), entry(55, 0));
    }

    #[test]
    fn it_keeps_strictly_smaller_entries_on_a_truncate_miss() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        index.truncate_to(80).unwrap();
        assert_eq!(index.entries(), 2);
        assert_eq!(index.last_offset(), 70);
    }

    #[test]
    fn truncate_to_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        index.truncate_to(80).unwrap();
        let entries = index.entries();
        let last_offset = index.last_offset();
        index.truncate_to(80).unwrap();
        assert_eq!(index.entries(), entries);
        assert_eq!(index.last_offset(), last_offset);
    }

    #[test]
    fn it_clears_everything_when_truncating_below_the_first_entry() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.truncate_to(10).unwrap();
        assert_eq!(index.entries(), 0);
        assert_eq!(index.last_offset(), 50);
        index.append(52, 64).unwrap();
        assert_eq!(index.lookup(52).unwrap(), entry(52, 64));
    }

    #[test]
    fn truncate_removes_all_entries() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.truncate().unwrap();
        assert_eq!(index.entries(), 0);
        assert_eq!(index.lookup(70).unwrap(), entry(50, 0));
    }

    #[test]
    fn it_survives_a_seal_close_reopen_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        let appended = [(55, 0), (70, 4096), (95, 8192)];
        {
            let index = new_index(&dir, 50, 8 * 1024);
            for (offset, position) in &appended {
                index.append(*offset, *position).unwrap();
            }
            index.make_read_only().unwrap();
            assert!(!index.is_writable());
            index.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
        let reopened = OffsetIndex::new(path, 50, None, Some(false)).unwrap();
        assert_eq!(reopened.entries(), 3);
        for (slot, (offset, position)) in appended.iter().enumerate() {
            assert_eq!(reopened.entry(slot).unwrap(), Some(entry(*offset, *position)));
        }
        assert_eq!(reopened.lookup(72).unwrap(), entry(70, 4096));
        reopened.sanity_check().unwrap();
    }

    #[test]
    fn it_seals_an_empty_index_to_a_zero_length_file() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        {
            let index = new_index(&dir, 50, 8 * 1024);
            index.make_read_only().unwrap();
            index.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        let reopened = OffsetIndex::new(path, 50, None, Some(false)).unwrap();
        assert_eq!(reopened.entries(), 0);
        assert_eq!(reopened.lookup(60).unwrap(), entry(50, 0));
        reopened.sanity_check().unwrap();
    }

    #[test]
    fn it_rejects_mutations_after_sealing() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.make_read_only().unwrap();
        assert!(matches!(index.append(60, 128), Err(IndexError::ReadOnly(_))));
        assert!(matches!(index.truncate_to(55), Err(IndexError::ReadOnly(_))));
        assert!(matches!(index.truncate(), Err(IndexError::ReadOnly(_))));
        // reads still work
        assert_eq!(index.lookup(55).unwrap(), entry(55, 0));
    }

    #[test]
    fn close_is_idempotent_and_later_operations_fail() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.close().unwrap();
        index.close().unwrap();
        assert!(matches!(index.lookup(55), Err(IndexError::Closed(_))));
        assert!(matches!(index.append(60, 128), Err(IndexError::Closed(_))));
        assert!(matches!(index.sanity_check(), Err(IndexError::Closed(_))));
        assert!(matches!(index.flush(), Err(IndexError::Closed(_))));
    }

    #[test]
    fn close_trims_a_writable_file_to_its_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        {
            let index = new_index(&dir, 50, 8 * 1024);
            index.append(55, 0).unwrap();
            index.append(70, 4096).unwrap();
            index.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
        let reopened = OffsetIndex::new(path, 50, Some(8 * 1024), None).unwrap();
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.last_offset(), 70);
    }

    #[test]
    fn it_ignores_the_preallocated_zero_tail_on_open() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        write_raw_entries(&path, &[(5, 0), (20, 4096)], 4096);
        let index = OffsetIndex::new(path, 50, Some(4096), None).unwrap();
        assert_eq!(index.entries(), 2);
        assert_eq!(index.last_offset(), 70);
        assert_eq!(index.lookup(80).unwrap(), entry(70, 4096));
    }

    #[test]
    fn it_stops_at_a_non_monotonic_tail_on_open() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        write_raw_entries(&path, &[(5, 0), (3, 9000)], 4096);
        let index = OffsetIndex::new(path, 50, Some(4096), None).unwrap();
        assert_eq!(index.entries(), 1);
        assert_eq!(index.last_offset(), 55);
    }

    #[test]
    fn it_treats_a_zeroed_first_slot_as_an_empty_index() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        write_raw_entries(&path, &[], 4096);
        let index = OffsetIndex::new(path, 50, Some(4096), None).unwrap();
        assert_eq!(index.entries(), 0);
        assert_eq!(index.lookup(60).unwrap(), entry(50, 0));
    }

    #[test]
    fn it_keeps_a_base_offset_entry_with_a_non_zero_position() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        write_raw_entries(&path, &[(0, 128)], 4096);
        let index = OffsetIndex::new(path, 50, Some(4096), None).unwrap();
        assert_eq!(index.entries(), 1);
        assert_eq!(index.lookup(50).unwrap(), entry(50, 128));
    }

    #[test]
    fn sanity_check_rejects_an_unaligned_file_length() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        std::fs::write(&path, [1u8; 13]).unwrap();
        let index = OffsetIndex::new(path, 50, Some(4096), None).unwrap();
        assert!(matches!(index.sanity_check(), Err(IndexError::CorruptIndex(_, _))));
    }

    #[test]
    fn sanity_check_accepts_a_healthy_index() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.sanity_check().unwrap();
    }

    #[test]
    fn it_finds_the_first_position_at_or_past_the_fetch_target() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        index.append(95, 8192).unwrap();
        // exact hit on an indexed position
        assert_eq!(
            index.fetch_upper_bound_offset(entry(55, 0), 4096).unwrap(),
            Some(entry(70, 4096))
        );
        // between indexed positions
        assert_eq!(
            index.fetch_upper_bound_offset(entry(55, 0), 5000).unwrap(),
            Some(entry(95, 8192))
        );
        // past every indexed position
        assert_eq!(index.fetch_upper_bound_offset(entry(70, 4096), 8192).unwrap(), None);
        // before every indexed position
        assert_eq!(index.fetch_upper_bound_offset(entry(50, 0), 0).unwrap(), Some(entry(55, 0)));
    }

    #[test]
    fn lookup_matches_a_linear_scan_for_every_target() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        let mut appended = Vec::new();
        for i in 0..200i64 {
            let offset = 50 + 3 * i + (i % 2);
            let position = (400 * i) as u32;
            index.append(offset, position).unwrap();
            appended.push((offset, position));
        }
        let last = appended[appended.len() - 1];
        for target in 45..last.0 + 10 {
            let expected = appended
                .iter()
                .rev()
                .find(|(offset, _)| *offset <= target)
                .map_or(entry(50, 0), |(offset, position)| entry(*offset, *position));
            assert_eq!(index.lookup(target).unwrap(), expected, "target {}", target);
        }
    }

    #[test]
    fn lookup_is_consistent_on_both_sides_of_the_warm_boundary() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 0, 64 * 1024);
        let total = 3000i64;
        for i in 0..total {
            index.append(2 * i, (128 * i) as u32).unwrap();
        }
        // with 3000 entries the warm tail holds the last 1024 slots, so
        // targets below offset 3952 search the cold head
        for target in &[0i64, 1, 999, 1000, 2047, 2048, 3950, 3952, 3999, 5998, 5999, 6010] {
            let expected = ((*target / 2) * 2).min(2 * (total - 1));
            let found = index.lookup(*target).unwrap();
            assert_eq!(found.offset, expected, "target {}", target);
            assert_eq!(i64::from(found.position), 64 * found.offset);
        }
        // a position target in the cold head resolves through the same path
        assert_eq!(
            index.fetch_upper_bound_offset(entry(0, 0), 100).unwrap(),
            Some(entry(2, 128))
        );
    }

    #[test]
    fn entry_past_the_live_prefix_is_none() {
        let dir = TempDir::new().unwrap();
        let index = new_index(&dir, 50, 8 * 1024);
        index.append(55, 0).unwrap();
        assert_eq!(index.entry(0).unwrap(), Some(entry(55, 0)));
        assert_eq!(index.entry(1).unwrap(), None);
    }

    #[test]
    fn resize_rounds_down_and_refuses_to_drop_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        let index = OffsetIndex::new(path.clone(), 50, Some(64), None).unwrap();
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        assert!(index.resize(41).unwrap());
        assert_eq!(index.max_entries(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
        // unchanged length reports false
        assert!(!index.resize(40).unwrap());
        // shrinking below the live entries is refused
        assert!(matches!(index.resize(8), Err(IndexError::Io(_))));
        // entries survive the remap
        assert_eq!(index.lookup(80).unwrap(), entry(70, 4096));
    }

    #[test]
    fn trim_to_valid_size_leaves_exactly_the_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        let index = OffsetIndex::new(path.clone(), 50, Some(8 * 1024), None).unwrap();
        index.append(55, 0).unwrap();
        index.append(70, 4096).unwrap();
        assert!(index.trim_to_valid_size().unwrap());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
        assert_eq!(index.max_entries(), 2);
        assert!(index.is_full());
    }

    #[test]
    fn it_renames_the_backing_file_in_place() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        let renamed = dir.path().join("00000000000000000050.index.deleted");
        let index = OffsetIndex::new(path.clone(), 50, Some(8 * 1024), None).unwrap();
        index.append(55, 0).unwrap();
        index.rename_to(renamed.clone()).unwrap();
        assert_eq!(index.file_path(), renamed);
        assert!(!path.exists());
        assert!(renamed.exists());
        assert_eq!(index.lookup(55).unwrap(), entry(55, 0));
    }

    #[test]
    fn delete_if_exists_removes_the_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = offset_index_file(dir.path(), 50);
        let index = OffsetIndex::new(path.clone(), 50, Some(8 * 1024), None).unwrap();
        index.append(55, 0).unwrap();
        assert!(index.delete_if_exists().unwrap());
        assert!(!path.exists());
        assert!(!index.delete_if_exists().unwrap());
    }

    #[test]
    fn concurrent_readers_never_observe_torn_entries() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(new_index(&dir, 50, 64 * 1024));
        let done = Arc::new(AtomicBool::new(false));
        let total = 600i64;

        let mut readers = Vec::new();
        for reader in 0..4 {
            let index = Arc::clone(&index);
            let done = Arc::clone(&done);
            readers.push(thread::spawn(move || {
                let mut target = 50 + reader;
                loop {
                    let found = index.lookup(target).unwrap();
                    if found.offset == 50 {
                        assert_eq!(found.position, 0);
                    } else {
                        // every appended pair satisfies position == 32 * (offset - 50)
                        assert!(found.offset <= target);
                        assert_eq!((found.offset - 50) % 2, 0);
                        assert_eq!(i64::from(found.position), 32 * (found.offset - 50));
                    }
                    target = 50 + (target + 7) % (2 * total + 40);
                    if done.load(Ordering::Acquire) {
                        break;
                    }
                }
            }));
        }

        for i in 0..total {
            index.append(50 + 2 * i, (64 * i) as u32).unwrap();
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(index.entries(), total as usize);
    }
}
