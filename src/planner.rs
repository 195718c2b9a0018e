//! Chunk planning for multipart uploads.
//!
//! Pure arithmetic over `(file size, chunk size)`; no I/O. The plan must be
//! stable across resumption — same inputs, same part numbers — so that part
//! numbers recorded by an earlier run keep their meaning.

/// Default chunk size for the client-side scheduler. Matches the storage
/// backend's minimum part size for all but the final part.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Hard ceiling on parts per multipart transaction (S3 limit).
pub const MAX_PARTS: i32 = 10_000;

/// One planned part: its 1-based number and the half-open byte range
/// `[offset, offset + len)` it covers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartSpan {
    pub part_number: i32,
    pub offset: u64,
    pub len: u64,
}

impl PartSpan {
    /// Exclusive end offset of this part's range.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Split `size` bytes into `ceil(size / chunk_size)` ordered parts.
///
/// Every part except possibly the last is exactly `chunk_size` bytes long;
/// together the ranges partition `[0, size)` with no gaps or overlaps.
/// Returns an empty plan for a zero size or zero chunk size.
pub fn plan_parts(size: u64, chunk_size: u64) -> Vec<PartSpan> {
    if size == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let count = size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            PartSpan {
                part_number: (i + 1) as i32,
                offset,
                len: chunk_size.min(size - offset),
            }
        })
        .collect()
}
