//! Deterministic partition of a file into multipart parts.
//!
//! The partition depends only on `(file_size, part_size)`, so the server and
//! the client agree on the part count and each part's byte range without ever
//! exchanging the partition itself.

use std::ops::Range;

/// One contiguous byte range of the source file, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

impl PartRange {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.len
    }
}

/// Number of parts needed to cover `file_size` bytes.
///
/// # Panics
///
/// Panics if `part_size` is zero.
pub fn parts_count(file_size: u64, part_size: u64) -> u64 {
    assert!(part_size > 0, "part size must be non-zero");
    file_size.div_ceil(part_size)
}

/// Split `file_size` bytes into ascending, non-overlapping parts of
/// `part_size` bytes. The last part may be shorter. An empty file has no parts.
///
/// # Panics
///
/// Panics if `part_size` is zero.
pub fn partition(file_size: u64, part_size: u64) -> Vec<PartRange> {
    let count = parts_count(file_size, part_size);
    (0..count)
        .map(|index| {
            let offset = index * part_size;
            PartRange {
                part_number: index as u32 + 1,
                offset,
                len: part_size.min(file_size - offset),
            }
        })
        .collect()
}

/// Byte length of `part_number` within the partition, or `None` when the part
/// lies outside of it.
pub fn part_len(file_size: u64, part_size: u64, part_number: u32) -> Option<u64> {
    if part_number == 0 {
        return None;
    }
    let offset = (part_number as u64 - 1).checked_mul(part_size)?;
    if offset >= file_size {
        return None;
    }
    Some(part_size.min(file_size - offset))
}
