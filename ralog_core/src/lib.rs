//! Storage primitives for a partitioned, append-only log: the sparse indices
//! that map logical message offsets and timestamps to physical byte positions
//! inside a log segment.

#![warn(rust_2018_idioms)]

pub mod log;
