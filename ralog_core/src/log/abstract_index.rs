//! Shared machinery of the segment indices.
//!
//! An index is a pre-allocated, memory-mapped array of fixed-size entries
//! over which two binary search shapes are answered: the greatest slot whose
//! compared component is at most a target, and the smallest slot whose
//! compared component is at least a target. Concrete indices plug into this
//! core through [`IndexCodec`]: an entry size, a slot decoder, and key/value
//! extractors on the decoded record.
//!
//! A single writer appends entries while any number of readers look them up;
//! one mutex serializes every operation against the mapped region and the
//! entry bookkeeping. Keys are strictly increasing across the live prefix;
//! appends enforce this and `sanity_check` re-validates it.

use super::index_file::{round_down_to_exact_multiple, IndexFile};
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default upper bound for the byte size of an index file.
pub const DEFAULT_MAX_INDEX_SIZE: usize = 10 * 1024 * 1024;

/// Byte length of the index tail that is searched first. Steady-state fetches
/// target the most recent entries; confining their search to a bounded tail
/// keeps those pages and TLB entries resident.
pub(crate) const WARM_SECTION_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),
    #[error("Attempt to append to a full index ({0} entries)")]
    IndexFull(usize),
    #[error("Attempt to append an offset {0} which is not larger than the last offset {1}")]
    InvalidOffset(i64, i64),
    #[error("Attempt to append a timestamp {0} which is smaller than the last timestamp {1}")]
    InvalidTimestamp(i64, i64),
    #[error("The offset {0} is out of the 32-bit relative range of base offset {1}")]
    OffsetOverflow(i64, i64),
    #[error("Corrupt index found at {0}: {1}")]
    CorruptIndex(String, String),
    #[error("Attempt to mutate the read-only index {0}")]
    ReadOnly(String),
    #[error("Attempt to operate on the closed index {0}")]
    Closed(String),
}

/// A decoded index entry.
pub(crate) trait IndexRecord: Copy + Debug {
    /// The component compared by KEY-mode searches.
    fn index_key(&self) -> i64;
    /// The component compared by VALUE-mode searches.
    fn index_value(&self) -> i64;
}

/// The capability set a concrete index plugs into the shared core.
pub(crate) trait IndexCodec {
    type Record: IndexRecord;
    /// On-disk size of one entry in bytes.
    const ENTRY_SIZE: usize;
    /// Decodes the entry at `slot` from the mapped region.
    fn parse_entry(buf: &[u8], base_offset: i64, slot: usize) -> Self::Record;
}

/// Which component of an entry a search compares against the target.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchKind {
    Key,
    Value,
}

/// Converts an absolute offset into the 32-bit relative form stored on disk.
pub(crate) fn relative_offset(base_offset: i64, offset: i64) -> Result<u32, IndexError> {
    let relative = offset - base_offset;
    if relative < 0 || relative > i64::from(u32::MAX) {
        return Err(IndexError::OffsetOverflow(offset, base_offset));
    }
    Ok(relative as u32)
}

/// Mutable state of an index: the backing file (`None` once closed) and the
/// entry bookkeeping, all guarded by one lock.
#[derive(Debug)]
pub(crate) struct IndexState<C: IndexCodec> {
    pub(crate) file: Option<IndexFile>,
    /// Current path of the backing file; outlives `file` so a closed index
    /// can still be renamed or deleted.
    pub(crate) path: PathBuf,
    /// Number of live entries. The write cursor is always `entries *
    /// ENTRY_SIZE`; slots past it are indeterminate and never read.
    pub(crate) entries: usize,
    pub(crate) max_entries: usize,
    pub(crate) last_entry: Option<C::Record>,
    pub(crate) writable: bool,
}

impl<C: IndexCodec> IndexState<C> {
    fn closed_error(&self) -> IndexError {
        IndexError::Closed(self.path.display().to_string())
    }

    fn read_only_error(&self) -> IndexError {
        IndexError::ReadOnly(self.path.display().to_string())
    }

    /// The backing file of an index that is still open.
    fn backing(&self) -> Result<&IndexFile, IndexError> {
        self.file.as_ref().ok_or_else(|| self.closed_error())
    }

    /// The backing file of an index that is still open and writable.
    fn writable_backing(&mut self) -> Result<&mut IndexFile, IndexError> {
        if self.file.is_some() && !self.writable {
            return Err(self.read_only_error());
        }
        match self.file {
            Some(ref mut file) => Ok(file),
            None => Err(IndexError::Closed(self.path.display().to_string())),
        }
    }
}

/// The index core: identified by the base offset of its paired segment,
/// parameterized over the entry codec of the concrete variant.
#[derive(Debug)]
pub(crate) struct AbstractIndex<C: IndexCodec> {
    base_offset: i64,
    max_index_size: usize,
    state: Mutex<IndexState<C>>,
}

impl<C: IndexCodec> AbstractIndex<C> {
    /// Opens the index at `file`, creating and pre-allocating it when absent
    /// and writable. The live entry count of an existing file is inferred
    /// from its content, never from its length alone.
    pub(crate) fn new(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: Option<bool>,
    ) -> Result<Self, IndexError> {
        let max_index_size = max_index_size.unwrap_or(DEFAULT_MAX_INDEX_SIZE);
        let writable = writable.unwrap_or(true);
        let backing = IndexFile::open(file, max_index_size, C::ENTRY_SIZE, writable)?;
        let max_entries = backing.length() / C::ENTRY_SIZE;
        let (entries, last_entry) = Self::infer_entries(backing.as_slice(), base_offset);
        trace!(
            "Loaded index {} with base offset {}, {} live entries out of {}",
            backing.path().display(),
            base_offset,
            entries,
            max_entries
        );
        let path = backing.path().to_path_buf();
        let state =
            IndexState { file: Some(backing), path, entries, max_entries, last_entry, writable };
        Ok(Self { base_offset, max_index_size, state: Mutex::new(state) })
    }

    /// Derives the live entry count of a freshly mapped file: the longest
    /// prefix of entries with strictly increasing keys. Slot 0 counts only
    /// when its bytes are not all zero; a zeroed slot 0 is pre-allocated
    /// tail, not an entry.
    fn infer_entries(buf: &[u8], base_offset: i64) -> (usize, Option<C::Record>) {
        let capacity = buf.len() / C::ENTRY_SIZE;
        if capacity == 0 || buf[..C::ENTRY_SIZE].iter().all(|byte| *byte == 0) {
            return (0, None);
        }
        let mut last = C::parse_entry(buf, base_offset, 0);
        let mut entries = 1;
        while entries < capacity {
            let entry = C::parse_entry(buf, base_offset, entries);
            if entry.index_key() <= last.index_key() {
                break;
            }
            last = entry;
            entries += 1;
        }
        (entries, Some(last))
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, IndexState<C>> {
        // a poisoned lock still guards a structurally valid region
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub(crate) fn max_index_size(&self) -> usize {
        self.max_index_size
    }

    pub(crate) fn file_path(&self) -> PathBuf {
        self.lock_state().path.clone()
    }

    pub(crate) fn entries(&self) -> usize {
        self.lock_state().entries
    }

    pub(crate) fn max_entries(&self) -> usize {
        self.lock_state().max_entries
    }

    pub(crate) fn is_full(&self) -> bool {
        let state = self.lock_state();
        state.entries >= state.max_entries
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.lock_state().writable
    }

    pub(crate) fn last_entry(&self) -> Option<C::Record> {
        self.lock_state().last_entry
    }

    /// Validates that `state` accepts an append: open, writable, not full.
    pub(crate) fn check_appendable(
        &self,
        state: &IndexState<C>,
        skip_full_check: bool,
    ) -> Result<(), IndexError> {
        if state.file.is_none() {
            return Err(state.closed_error());
        }
        if !state.writable {
            return Err(state.read_only_error());
        }
        if !skip_full_check && state.entries >= state.max_entries {
            return Err(IndexError::IndexFull(state.entries));
        }
        Ok(())
    }

    /// Writes an encoded entry at the next slot and records `entry` as the
    /// last one. The caller has already validated ordering and writability.
    pub(crate) fn append_entry_bytes(
        &self,
        state: &mut IndexState<C>,
        bytes: &[u8],
        entry: C::Record,
    ) -> Result<(), IndexError> {
        let at = state.entries * C::ENTRY_SIZE;
        let file = state.writable_backing()?;
        if at + C::ENTRY_SIZE > file.length() {
            // backstop for callers that skipped the capacity check
            return Err(IndexError::IndexFull(at / C::ENTRY_SIZE));
        }
        file.write_at(at, bytes)?;
        state.entries += 1;
        state.last_entry = Some(entry);
        Ok(())
    }

    /// Entry at the greatest live slot whose `kind` component is at most
    /// `target`, or `None` when every live entry is above the target.
    pub(crate) fn largest_lower_bound_entry(
        &self,
        target: i64,
        kind: SearchKind,
    ) -> Result<Option<C::Record>, IndexError> {
        let state = self.lock_state();
        let buf = state.backing()?.as_slice();
        let (lower, _) = self.index_slot_range_for(buf, state.entries, target, kind);
        Ok(lower.map(|slot| C::parse_entry(buf, self.base_offset, slot)))
    }

    /// Entry at the smallest live slot whose `kind` component is at least
    /// `target`, or `None` when every live entry is below the target.
    pub(crate) fn smallest_upper_bound_entry(
        &self,
        target: i64,
        kind: SearchKind,
    ) -> Result<Option<C::Record>, IndexError> {
        let state = self.lock_state();
        let buf = state.backing()?.as_slice();
        let (_, upper) = self.index_slot_range_for(buf, state.entries, target, kind);
        Ok(upper.map(|slot| C::parse_entry(buf, self.base_offset, slot)))
    }

    /// Decoded entry at `slot`, if it lies within the live prefix.
    pub(crate) fn entry(&self, slot: usize) -> Result<Option<C::Record>, IndexError> {
        let state = self.lock_state();
        let buf = state.backing()?.as_slice();
        if slot >= state.entries {
            return Ok(None);
        }
        Ok(Some(C::parse_entry(buf, self.base_offset, slot)))
    }

    /// Answers both search shapes over a snapshot of the mapped region: `.0`
    /// is the greatest slot with component <= target, `.1` the smallest slot
    /// with component >= target. Searches the warm tail first and falls back
    /// to the cold head only when the target precedes the first warm key;
    /// the split changes the access pattern, never the result.
    fn index_slot_range_for(
        &self,
        buf: &[u8],
        entries: usize,
        target: i64,
        kind: SearchKind,
    ) -> (Option<usize>, Option<usize>) {
        if entries == 0 {
            return (None, None);
        }
        let warm_slots = entries.min(WARM_SECTION_BYTES / C::ENTRY_SIZE);
        let first_warm_slot = entries - warm_slots;
        if self.component_at(buf, first_warm_slot, kind) <= target {
            return self.binary_search(buf, entries, target, kind, first_warm_slot, entries - 1);
        }
        if self.component_at(buf, 0, kind) > target {
            return (None, Some(0));
        }
        self.binary_search(buf, entries, target, kind, 0, first_warm_slot)
    }

    fn component_at(&self, buf: &[u8], slot: usize, kind: SearchKind) -> i64 {
        let entry = C::parse_entry(buf, self.base_offset, slot);
        match kind {
            SearchKind::Key => entry.index_key(),
            SearchKind::Value => entry.index_value(),
        }
    }

    /// Classical lower-bound search over `[begin, end]`; requires
    /// `component(begin) <= target`.
    fn binary_search(
        &self,
        buf: &[u8],
        entries: usize,
        target: i64,
        kind: SearchKind,
        begin: usize,
        end: usize,
    ) -> (Option<usize>, Option<usize>) {
        let (mut lo, mut hi) = (begin, end);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.component_at(buf, mid, kind) > target {
                hi = mid - 1;
            } else {
                lo = mid;
            }
        }
        let upper = if self.component_at(buf, lo, kind) == target {
            Some(lo)
        } else if lo + 1 < entries {
            Some(lo + 1)
        } else {
            None
        };
        (Some(lo), upper)
    }

    /// Removes all entries.
    pub(crate) fn truncate(&self) -> Result<(), IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.writable_backing()?;
        self.set_live_entries(state, 0);
        Ok(())
    }

    /// Removes every entry whose `kind` component is at or above `target`;
    /// an exact hit drops the matching entry as well.
    pub(crate) fn truncate_to_target(
        &self,
        target: i64,
        kind: SearchKind,
    ) -> Result<(), IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        state.writable_backing()?;
        let new_entries = {
            let buf = state.backing()?.as_slice();
            match self.index_slot_range_for(buf, state.entries, target, kind).0 {
                None => 0,
                Some(slot) if self.component_at(buf, slot, kind) == target => slot,
                Some(slot) => slot + 1,
            }
        };
        self.set_live_entries(state, new_entries);
        Ok(())
    }

    /// Resets the live prefix to `new_entries`. The truncated bytes keep
    /// their old contents; the live prefix alone defines the index.
    fn set_live_entries(&self, state: &mut IndexState<C>, new_entries: usize) {
        state.entries = new_entries;
        state.last_entry = match &state.file {
            Some(file) if new_entries > 0 => {
                Some(C::parse_entry(file.as_slice(), self.base_offset, new_entries - 1))
            },
            _ => None,
        };
        debug!("Truncated index {} to {} entries", state.path.display(), new_entries);
    }

    /// Forces dirty pages of the mapping to disk. Best effort apart from the
    /// closed check: a flush failure is logged, not surfaced.
    pub(crate) fn flush(&self) -> Result<(), IndexError> {
        let state = self.lock_state();
        state.backing()?.flush();
        Ok(())
    }

    /// Resizes the backing file to the largest multiple of the entry size
    /// not exceeding `new_size`, remapping it. Returns whether the file
    /// length changed. Shrinking below the live entries is refused.
    pub(crate) fn resize(&self, new_size: usize) -> Result<bool, IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let rounded = round_down_to_exact_multiple(new_size, C::ENTRY_SIZE);
        let live_length = state.entries * C::ENTRY_SIZE;
        if rounded < live_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot resize index {} to {} bytes below its {} live entries",
                    state.path.display(),
                    rounded,
                    state.entries
                ),
            )
            .into());
        }
        let file = state.writable_backing()?;
        if file.length() == rounded {
            return Ok(false);
        }
        file.resize(rounded)?;
        state.max_entries = rounded / C::ENTRY_SIZE;
        Ok(true)
    }

    /// Trims the backing file to exactly the byte length of the live
    /// entries.
    pub(crate) fn trim_to_valid_size(&self) -> Result<bool, IndexError> {
        let valid_size = self.entries() * C::ENTRY_SIZE;
        self.resize(valid_size)
    }

    /// Seals the index: trims the file to the live entries and remaps it
    /// read-only. Appends and truncations fail afterwards.
    pub(crate) fn make_read_only(&self) -> Result<(), IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let valid_length = state.entries * C::ENTRY_SIZE;
        let file = state.writable_backing()?;
        file.make_read_only(valid_length)?;
        state.writable = false;
        state.max_entries = state.entries;
        Ok(())
    }

    /// Structural checks shared by the index variants: the file length must
    /// be a multiple of the entry size and the live prefix must carry
    /// strictly increasing keys.
    pub(crate) fn sanity_check_core(&self) -> Result<(), IndexError> {
        let state = self.lock_state();
        let file = state.backing()?;
        if file.length() % C::ENTRY_SIZE != 0 {
            return Err(IndexError::CorruptIndex(
                state.path.display().to_string(),
                format!(
                    "file length {} is not a multiple of the {}-byte entry size",
                    file.length(),
                    C::ENTRY_SIZE
                ),
            ));
        }
        let buf = file.as_slice();
        let mut previous: Option<i64> = None;
        for slot in 0..state.entries {
            let key = C::parse_entry(buf, self.base_offset, slot).index_key();
            if let Some(previous) = previous {
                if key <= previous {
                    return Err(IndexError::CorruptIndex(
                        state.path.display().to_string(),
                        format!(
                            "entry {} key {} is not larger than its predecessor {}",
                            slot, key, previous
                        ),
                    ));
                }
            }
            previous = Some(key);
        }
        Ok(())
    }

    /// Flushes, trims a writable file to its live entries, and releases the
    /// mapping and file handle. Safe to call more than once.
    pub(crate) fn close(&self) -> Result<(), IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if let Some(mut file) = state.file.take() {
            if state.writable {
                file.trim_to(state.entries * C::ENTRY_SIZE)?;
            } else {
                file.flush();
            }
            state.writable = false;
            trace!("Closed index {}", state.path.display());
        }
        Ok(())
    }

    /// Closes the index and removes its backing file. Returns whether a file
    /// was deleted.
    pub(crate) fn delete_if_exists(&self) -> Result<bool, IndexError> {
        self.close()?;
        let state = self.lock_state();
        match fs_err::remove_file(&state.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Renames the backing file in place; works on open and closed indices
    /// and tolerates a source file that is already gone.
    pub(crate) fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        match &mut state.file {
            Some(file) => file.rename_to(new_path.clone())?,
            None => {
                if let Err(err) = fs_err::rename(&state.path, &new_path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err.into());
                    }
                }
            },
        }
        state.path = new_path;
        Ok(())
    }

    /// Re-homes the index path after the owning directory moved.
    pub(crate) fn update_parent_dir(&self, parent_dir: &Path) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if let Some(name) = state.path.file_name().map(|name| name.to_os_string()) {
            state.path = parent_dir.join(name);
        }
        if let Some(file) = &mut state.file {
            file.update_parent_dir(parent_dir);
        }
    }
}

impl<C: IndexCodec> Drop for AbstractIndex<C> {
    fn drop(&mut self) {
        // releases the mapping and trims the file for indices the owning
        // segment never closed explicitly
        if let Err(err) = self.close() {
            warn!("Failed to close index on drop: {}", err);
        }
    }
}
