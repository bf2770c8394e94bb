//! Offset and time indices for append-only log segments.
//!
//! Each segment `<base_offset>.log` is paired with index files that let a
//! reader seek into it without scanning from the start:
//! - `<base_offset>.index` maps message offsets to byte positions
//!   ([`offset_index::OffsetIndex`]).
//! - `<base_offset>.timeindex` maps timestamps to message offsets
//!   ([`time_index::TimeIndex`]).
//!
//! The base offset is carried by the file name alone, zero-padded to 20
//! digits, e.g. `00000000000000000050.index`.

pub mod abstract_index;
pub(crate) mod index_file;
pub mod lazy_index;
pub mod offset_index;
pub mod time_index;

use lazy_static::lazy_static;
use regex::Regex;
use std::num;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Offset index file suffix
pub const INDEX_FILE_SUFFIX: &str = ".index";

/// Time index file suffix
pub const TIME_INDEX_FILE_SUFFIX: &str = ".timeindex";

/// An index file scheduled for deletion
pub const DELETED_FILE_SUFFIX: &str = ".deleted";

/// Errors from mapping index file names back to their base offset.
#[derive(Debug, Error)]
pub enum IndexFileNameError {
    #[error("Parse error: {0}")]
    ParseInt(#[from] num::ParseIntError),
    #[error("Not an index file name: {0}")]
    NotAnIndexFile(String),
}

/// Zero-pads an offset into the 20-digit prefix shared by a segment and its
/// index files, so that lexical and numeric ordering agree.
pub fn filename_prefix_from_offset(offset: i64) -> String {
    format!("{:020}", offset)
}

/// Path of the offset index file for the segment starting at `offset`.
pub fn offset_index_file(dir: &Path, offset: i64) -> PathBuf {
    dir.join(format!("{}{}", filename_prefix_from_offset(offset), INDEX_FILE_SUFFIX))
}

/// Path of the time index file for the segment starting at `offset`.
pub fn time_index_file(dir: &Path, offset: i64) -> PathBuf {
    dir.join(format!("{}{}", filename_prefix_from_offset(offset), TIME_INDEX_FILE_SUFFIX))
}

/// Recovers the base offset encoded in an index file name.
pub fn offset_from_index_file_name(filename: &str) -> Result<i64, IndexFileNameError> {
    lazy_static! {
        static ref INDEX_FILE_PATTERN: Regex =
            Regex::new(r"^(\d{20})(\.index|\.timeindex)$").unwrap();
    }
    match INDEX_FILE_PATTERN.captures(filename) {
        Some(captures) => Ok(captures.get(1).map_or("", |m| m.as_str()).parse::<i64>()?),
        None => Err(IndexFileNameError::NotAnIndexFile(filename.to_string())),
    }
}
