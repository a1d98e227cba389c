//! Utility functions that may be helpful for implementing
//! and testing MapReduce applications.
//!

use anyhow::Result;
use bytes::Bytes;
use itertools::Itertools;
use std::path::PathBuf;

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Expands a glob spec into the matching files, in path order.
///
/// Directories and unreadable entries are skipped.
pub fn input_files(pattern: &str) -> Result<Vec<PathBuf>> {
    Ok(glob::glob(pattern)?
        .flatten()
        .filter(|path| path.is_file())
        .sorted()
        .collect())
}

/// Name of the output file written for reduce partition `partition`.
pub fn output_name(partition: usize) -> String {
    format!("mr-out-{}", partition)
}
