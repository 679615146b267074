//! Memory reservation sizing.

/// One megabyte (decimal), the unit of the sizing tiers.
pub const MB: u64 = 1_000_000;

const SMALL_FILE_LIMIT: u64 = 100 * MB;
const MEDIUM_FILE_LIMIT: u64 = 1000 * MB;
const LARGE_FILE_CAP: u64 = 100 * MB;

/// Bytes to reserve for an upload of `declared_size` bytes.
///
/// - below 100 MB: 20% of the size
/// - below 1 GB: 10% of the size
/// - otherwise: 5% of the size, capped at 100 MB
pub fn reservation_for_size(declared_size: u64) -> u64 {
    if declared_size < SMALL_FILE_LIMIT {
        declared_size / 5
    } else if declared_size < MEDIUM_FILE_LIMIT {
        declared_size / 10
    } else {
        (declared_size / 20).min(LARGE_FILE_CAP)
    }
}
