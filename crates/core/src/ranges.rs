//! Byte ranges and the set of ranges a destination has acknowledged.

use std::collections::BTreeMap;
use std::fmt;

/// Half-open byte range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range. `end` is clamped up to `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Value for an HTTP `Content-Range` header.
    ///
    /// Empty ranges use the `bytes */total` form.
    pub fn content_range(&self, total: u64) -> String {
        if self.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{}", self.start, self.end - 1, total)
        }
    }

    /// Parse an HTTP `Range` response header such as `bytes=0-1023`.
    ///
    /// The result is the half-open equivalent (`[0, 1024)`).
    pub fn parse_range_header(value: &str) -> crate::Result<Self> {
        let spec = value
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| crate::Error::InvalidRange(value.to_string()))?;
        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| crate::Error::InvalidRange(value.to_string()))?;
        let start: u64 = start
            .parse()
            .map_err(|_| crate::Error::InvalidRange(value.to_string()))?;
        let end: u64 = end
            .parse()
            .map_err(|_| crate::Error::InvalidRange(value.to_string()))?;
        if end < start {
            return Err(crate::Error::InvalidRange(value.to_string()));
        }
        Ok(Self::new(start, end + 1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Merged set of acknowledged byte ranges for one file.
///
/// Stored as disjoint, non-adjacent intervals keyed by start offset, so
/// "all bytes `0..N` acknowledged" is distinguishable from "N bytes
/// acknowledged with gaps".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AckedRanges {
    intervals: BTreeMap<u64, u64>,
}

impl AckedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acknowledged range, merging with neighbours.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // Merge with an interval starting at or before `start` that reaches it.
        if let Some((&s, &e)) = self.intervals.range(..=start).next_back()
            && e >= start
        {
            start = s;
            end = end.max(e);
            self.intervals.remove(&s);
        }

        // Absorb every interval starting inside `[start, end]`.
        let overlapping: Vec<(u64, u64)> = self
            .intervals
            .range(start..=end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            end = end.max(e);
            self.intervals.remove(&s);
        }

        self.intervals.insert(start, end);
    }

    /// Largest offset below which every byte is acknowledged.
    pub fn high_water_mark(&self) -> u64 {
        match self.intervals.first_key_value() {
            Some((&0, &end)) => end,
            _ => 0,
        }
    }

    /// Total number of acknowledged bytes, contiguous or not.
    pub fn acknowledged_bytes(&self) -> u64 {
        self.intervals.iter().map(|(s, e)| e - s).sum()
    }

    /// Whether every byte of `0..total` has been acknowledged.
    pub fn is_complete(&self, total: u64) -> bool {
        total == 0 || self.high_water_mark() >= total
    }

    /// Ranges of `0..total` not yet acknowledged.
    pub fn gaps(&self, total: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for (&s, &e) in &self.intervals {
            if s >= total {
                break;
            }
            if s > cursor {
                gaps.push(ByteRange::new(cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < total {
            gaps.push(ByteRange::new(cursor, total));
        }
        gaps
    }

    /// Number of disjoint intervals held.
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }
}
