//! Deferred construction of segment indices.
//!
//! A log directory may hold thousands of sealed segments; materializing every
//! index at startup would open and map every file. A [`LazyIndex`] holds the
//! path and open parameters, creates the index on first access, and still
//! supports the file-level operations the segment lifecycle needs before that
//! point (rename, delete).

use super::abstract_index::IndexError;
use super::offset_index::OffsetIndex;
use super::time_index::TimeIndex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// File-level operations shared by the index variants, so that [`LazyIndex`]
/// can manage either.
pub trait IndexWrapper: Sized {
    fn open_at(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: Option<bool>,
    ) -> Result<Self, IndexError>;
    fn file_path(&self) -> PathBuf;
    fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError>;
    fn update_parent_dir(&self, parent_dir: &Path);
    fn delete_if_exists(&self) -> Result<bool, IndexError>;
    fn close(&self) -> Result<(), IndexError>;
}

impl IndexWrapper for OffsetIndex {
    fn open_at(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: Option<bool>,
    ) -> Result<Self, IndexError> {
        Self::new(file, base_offset, max_index_size, writable)
    }

    fn file_path(&self) -> PathBuf {
        OffsetIndex::file_path(self)
    }

    fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError> {
        OffsetIndex::rename_to(self, new_path)
    }

    fn update_parent_dir(&self, parent_dir: &Path) {
        OffsetIndex::update_parent_dir(self, parent_dir)
    }

    fn delete_if_exists(&self) -> Result<bool, IndexError> {
        OffsetIndex::delete_if_exists(self)
    }

    fn close(&self) -> Result<(), IndexError> {
        OffsetIndex::close(self)
    }
}

impl IndexWrapper for TimeIndex {
    fn open_at(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: Option<bool>,
    ) -> Result<Self, IndexError> {
        Self::new(file, base_offset, max_index_size, writable)
    }

    fn file_path(&self) -> PathBuf {
        TimeIndex::file_path(self)
    }

    fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError> {
        TimeIndex::rename_to(self, new_path)
    }

    fn update_parent_dir(&self, parent_dir: &Path) {
        TimeIndex::update_parent_dir(self, parent_dir)
    }

    fn delete_if_exists(&self) -> Result<bool, IndexError> {
        TimeIndex::delete_if_exists(self)
    }

    fn close(&self) -> Result<(), IndexError> {
        TimeIndex::close(self)
    }
}

#[derive(Debug)]
struct LazyState<T> {
    file: PathBuf,
    index: Option<Arc<T>>,
}

/// A segment index that is opened on first access.
#[derive(Debug)]
pub struct LazyIndex<T: IndexWrapper> {
    base_offset: i64,
    max_index_size: Option<usize>,
    writable: bool,
    state: Mutex<LazyState<T>>,
}

impl<T: IndexWrapper> LazyIndex<T> {
    fn with_file(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: bool,
    ) -> Self {
        Self {
            base_offset,
            max_index_size,
            writable,
            state: Mutex::new(LazyState { file, index: None }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LazyState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The index, created and mapped on first use.
    pub fn get(&self) -> Result<Arc<T>, IndexError> {
        let mut state = self.lock_state();
        match &state.index {
            Some(index) => Ok(Arc::clone(index)),
            None => {
                let index = Arc::new(T::open_at(
                    state.file.clone(),
                    self.base_offset,
                    self.max_index_size,
                    Some(self.writable),
                )?);
                state.index = Some(Arc::clone(&index));
                Ok(index)
            },
        }
    }

    /// Whether the underlying index has been materialized.
    pub fn is_loaded(&self) -> bool {
        self.lock_state().index.is_some()
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn file_path(&self) -> PathBuf {
        self.lock_state().file.clone()
    }

    /// Renames the backing file whether or not the index exists yet; a
    /// missing file is tolerated.
    pub fn rename_to(&self, new_path: PathBuf) -> Result<(), IndexError> {
        let mut state = self.lock_state();
        match &state.index {
            Some(index) => index.rename_to(new_path.clone())?,
            None => {
                if let Err(err) = fs_err::rename(&state.file, &new_path) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err.into());
                    }
                }
            },
        }
        state.file = new_path;
        Ok(())
    }

    /// Re-homes the index path after the owning directory moved.
    pub fn update_parent_dir(&self, parent_dir: &Path) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if let Some(name) = state.file.file_name().map(|name| name.to_os_string()) {
            state.file = parent_dir.join(name);
        }
        if let Some(index) = &state.index {
            index.update_parent_dir(parent_dir);
        }
    }

    /// Deletes the backing file, closing the index first when materialized.
    /// Returns whether a file was deleted.
    pub fn delete_if_exists(&self) -> Result<bool, IndexError> {
        let mut state = self.lock_state();
        match state.index.take() {
            Some(index) => index.delete_if_exists(),
            None => match fs_err::remove_file(&state.file) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Closes the index when it has been materialized; a no-op otherwise.
    pub fn close(&self) -> Result<(), IndexError> {
        let state = self.lock_state();
        match &state.index {
            Some(index) => index.close(),
            None => Ok(()),
        }
    }
}

impl LazyIndex<OffsetIndex> {
    /// Lazy handle over the offset index at `file`.
    pub fn for_offset(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: bool,
    ) -> Self {
        Self::with_file(file, base_offset, max_index_size, writable)
    }
}

impl LazyIndex<TimeIndex> {
    /// Lazy handle over the time index at `file`.
    pub fn for_time(
        file: PathBuf,
        base_offset: i64,
        max_index_size: Option<usize>,
        writable: bool,
    ) -> Self {
        Self::with_file(file, base_offset, max_index_size, writable)
    }
}
