//! Change-only progress coalescing.

/// `floor(bytes * 100 / total)`, capped at 100. An empty file is 100%.
pub fn percent(bytes: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (bytes as u128 * 100) / total as u128;
    pct.min(100) as u8
}

/// Emits a progress percentage only when the integer value changes.
///
/// Reported values never decrease, even if a caller passes a smaller byte
/// count than before.
#[derive(Debug, Clone)]
pub struct ProgressCoalescer {
    total: u64,
    last: Option<u8>,
}

impl ProgressCoalescer {
    pub fn new(total: u64) -> Self {
        Self { total, last: None }
    }

    /// Feed the current byte count; returns `Some(pct)` when a message
    /// should be sent.
    pub fn update(&mut self, bytes_so_far: u64) -> Option<u8> {
        let pct = percent(bytes_so_far, self.total);
        match self.last {
            Some(last) if pct <= last => None,
            _ => {
                self.last = Some(pct);
                Some(pct)
            }
        }
    }

    /// Last value emitted.
    pub fn last(&self) -> Option<u8> {
        self.last
    }
}
