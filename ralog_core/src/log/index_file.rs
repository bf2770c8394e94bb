//! Memory-mapped backing file shared by the offset and time indices.
//!
//! The file is pre-allocated to its maximum size and fully mapped while the
//! index is writable; sealing trims it to the length of the live entries and
//! remaps it read-only. Callers never touch the file directly, they read and
//! write through the mapped byte region.

use fs_err::{File, OpenOptions};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Rounds `number` down to the largest multiple of `factor` not exceeding it.
pub(crate) fn round_down_to_exact_multiple(number: usize, factor: usize) -> usize {
    factor * (number / factor)
}

/// The mapped view over the backing file.
///
/// A zero-length file carries no mapping at all: mapping zero bytes is not
/// portable, and an empty slice serves readers equally well.
#[derive(Debug)]
enum IndexMmap {
    Writable(MmapMut),
    ReadOnly(Mmap),
    Empty,
}

impl IndexMmap {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Writable(mmap) => &mmap[..],
            Self::ReadOnly(mmap) => &mmap[..],
            Self::Empty => &[],
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            Self::Writable(mmap) => mmap.flush(),
            Self::ReadOnly(_) | Self::Empty => Ok(()),
        }
    }
}

/// Owns the backing file of an index and its memory mapping.
#[derive(Debug)]
pub(crate) struct IndexFile {
    path: PathBuf,
    file: File,
    mmap: IndexMmap,
    length: usize,
    writable: bool,
}

impl IndexFile {
    /// Opens (or creates) the backing file and maps the whole of it.
    ///
    /// A writable file is grown to the largest multiple of `entry_size` not
    /// exceeding `max_file_size`. An existing file whose length is not a
    /// multiple of `entry_size` is left untouched so that a later sanity
    /// check can report the corruption.
    pub(crate) fn open(
        path: PathBuf,
        max_file_size: usize,
        entry_size: usize,
        writable: bool,
    ) -> io::Result<Self> {
        let file =
            OpenOptions::new().read(true).write(writable).create(writable).open(&path)?;
        let mut length = file.metadata()?.len() as usize;
        if writable {
            let target = round_down_to_exact_multiple(max_file_size, entry_size);
            if length < target && length % entry_size == 0 {
                file.set_len(target as u64)?;
                length = target;
            }
        }
        let mmap = Self::map_region(&file, length, writable)?;
        trace!("Opened index file {} with length {}", path.display(), length);
        Ok(Self { path, file, mmap, length, writable })
    }

    fn map_region(file: &File, length: usize, writable: bool) -> io::Result<IndexMmap> {
        if length == 0 {
            return Ok(IndexMmap::Empty);
        }
        let mmap = if writable {
            IndexMmap::Writable(unsafe { MmapOptions::new().len(length).map_mut(file.file())? })
        } else {
            IndexMmap::ReadOnly(unsafe { MmapOptions::new().len(length).map(file.file())? })
        };
        Ok(mmap)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length, which is also the mapped length.
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    /// The mapped byte region.
    pub(crate) fn as_slice(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    /// Writes `bytes` at byte position `at` of the mapped region. The caller
    /// guarantees the range lies within the mapped length.
    pub(crate) fn write_at(&mut self, at: usize, bytes: &[u8]) -> io::Result<()> {
        match &mut self.mmap {
            IndexMmap::Writable(mmap) => {
                mmap[at..at + bytes.len()].copy_from_slice(bytes);
                Ok(())
            },
            IndexMmap::ReadOnly(_) | IndexMmap::Empty => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("index file {} is not mapped writable", self.path.display()),
            )),
        }
    }

    /// Forces dirty pages of the mapping out to disk. Best effort: a failed
    /// flush is logged and swallowed, the page cache still holds the data.
    pub(crate) fn flush(&self) {
        if let Err(err) = self.mmap.flush() {
            warn!("Failed to flush index file {}: {}", self.path.display(), err);
        }
    }

    /// Truncates or extends the file to `new_length` bytes and remaps it.
    ///
    /// The mapping is dropped before the file length changes and re-created
    /// afterwards; the caller serializes readers around this window.
    pub(crate) fn resize(&mut self, new_length: usize) -> io::Result<()> {
        self.flush();
        self.mmap = IndexMmap::Empty;
        self.file.set_len(new_length as u64)?;
        self.length = new_length;
        self.mmap = Self::map_region(&self.file, new_length, self.writable)?;
        debug!("Resized index file {} to {}", self.path.display(), new_length);
        Ok(())
    }

    /// Trims the file to `valid_length` bytes and remaps it read-only.
    pub(crate) fn make_read_only(&mut self, valid_length: usize) -> io::Result<()> {
        self.flush();
        self.mmap = IndexMmap::Empty;
        self.file.set_len(valid_length as u64)?;
        self.length = valid_length;
        self.writable = false;
        self.mmap = Self::map_region(&self.file, valid_length, false)?;
        debug!("Sealed index file {} at length {}", self.path.display(), valid_length);
        Ok(())
    }

    /// Flushes and trims the file to `valid_length` bytes without remapping;
    /// used on close, where the mapping is released right after.
    pub(crate) fn trim_to(&mut self, valid_length: usize) -> io::Result<()> {
        self.flush();
        self.mmap = IndexMmap::Empty;
        self.file.set_len(valid_length as u64)?;
        self.length = valid_length;
        Ok(())
    }

    /// Renames the backing file, tolerating a source that is already gone.
    pub(crate) fn rename_to(&mut self, new_path: PathBuf) -> io::Result<()> {
        if let Err(err) = fs_err::rename(&self.path, &new_path) {
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err);
            }
        }
        self.path = new_path;
        Ok(())
    }

    /// Re-homes the path after the owning directory moved; the open file
    /// handle and mapping are unaffected.
    pub(crate) fn update_parent_dir(&mut self, parent_dir: &Path) {
        if let Some(name) = self.path.file_name() {
            self.path = parent_dir.join(name);
        }
    }
}
