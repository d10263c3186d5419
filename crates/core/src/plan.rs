//! Copy planning: one-shot versus chunked, and part boundaries.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One contiguous byte range of a chunked copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRange {
    /// Zero-based part index. Parts are composed in index order.
    pub index: u32,
    /// Byte offset of the first byte (inclusive).
    pub start: u64,
    /// Byte offset one past the last byte (exclusive).
    pub end: u64,
}

impl PartRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// How an object of a given size is copied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyPlan {
    pub one_shot: bool,
    pub parts: Vec<PartRange>,
}

impl CopyPlan {
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn total_size(&self) -> u64 {
        self.parts.last().map(|p| p.end).unwrap_or(0)
    }
}

/// Plan a copy of `size` bytes with the given part size.
///
/// One-shot iff `size <= part_size`, in which case the plan holds a single
/// part covering the whole object (possibly empty). Otherwise the parts tile
/// `[0, size)` in `part_size` steps with a shorter final part.
pub fn plan(size: u64, part_size: u64) -> crate::Result<CopyPlan> {
    if part_size == 0 {
        return Err(crate::Error::InvalidPlan(
            "part size must be greater than zero".to_string(),
        ));
    }

    if size <= part_size {
        return Ok(CopyPlan {
            one_shot: true,
            parts: vec![PartRange {
                index: 0,
                start: 0,
                end: size,
            }],
        });
    }

    let count = size.div_ceil(part_size);
    let count = u32::try_from(count).map_err(|_| {
        crate::Error::InvalidPlan(format!(
            "{size} bytes in {part_size}-byte parts needs {count} parts"
        ))
    })?;

    let parts = (0..count)
        .map(|index| {
            let start = u64::from(index) * part_size;
            PartRange {
                index,
                start,
                end: (start + part_size).min(size),
            }
        })
        .collect();

    Ok(CopyPlan {
        one_shot: false,
        parts,
    })
}
