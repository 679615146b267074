//! Chunk size classes and chunk planning.

use crate::MIB;
use crate::ranges::ByteRange;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Buffer size classes used for chunking.
///
/// Chunk lengths are multiples of 256 KiB so they stay valid for
/// resumable-upload destinations that require aligned intermediate ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// All classes, smallest first.
    pub const ALL: [SizeClass; 3] = [SizeClass::Small, SizeClass::Medium, SizeClass::Large];

    /// Capacity of a buffer in this class, in bytes.
    pub const fn capacity(&self) -> u64 {
        match self {
            Self::Small => 8 * MIB,
            Self::Medium => 16 * MIB,
            Self::Large => 32 * MIB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// Pick a class for the next chunk.
    ///
    /// Chooses the smallest class able to cover `remaining` bytes in
    /// `target_concurrency` chunks. Files too large for that fall back to
    /// `Large`, small remainders to `Small`.
    pub fn for_remaining(remaining: u64, target_concurrency: usize) -> Self {
        let target = target_concurrency.max(1) as u64;
        let per_chunk = remaining.div_ceil(target);
        Self::ALL
            .into_iter()
            .find(|class| class.capacity() >= per_chunk)
            .unwrap_or(Self::Large)
    }

    /// Largest class whose capacity fits in `bytes`, or `Small` if none does.
    pub fn largest_within(bytes: u64) -> Self {
        Self::ALL
            .into_iter()
            .rev()
            .find(|class| class.capacity() <= bytes)
            .unwrap_or(Self::Small)
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned chunk: its class and the byte range it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub class: SizeClass,
    pub range: ByteRange,
}

/// Plan the chunk that starts at `offset` in a file of `total` bytes.
///
/// Returns `None` once the whole file is covered.
pub fn next_chunk(offset: u64, total: u64, target_concurrency: usize) -> Option<ChunkPlan> {
    next_chunk_capped(offset, total, target_concurrency, SizeClass::Large)
}

/// Like [`next_chunk`], never picking a class larger than `max_class`.
pub fn next_chunk_capped(
    offset: u64,
    total: u64,
    target_concurrency: usize,
    max_class: SizeClass,
) -> Option<ChunkPlan> {
    if offset >= total {
        return None;
    }
    let remaining = total - offset;
    let class = SizeClass::for_remaining(remaining, target_concurrency).min(max_class);
    let len = remaining.min(class.capacity());
    Some(ChunkPlan {
        class,
        range: ByteRange::new(offset, offset + len),
    })
}

/// Plan every chunk of a file of `total` bytes.
pub fn plan_chunks(total: u64, target_concurrency: usize) -> Vec<ChunkPlan> {
    let mut plans = Vec::new();
    let mut offset = 0;
    while let Some(plan) = next_chunk(offset, total, target_concurrency) {
        offset = plan.range.end;
        plans.push(plan);
    }
    plans
}
