//! Repository traits for metadata operations.

pub mod batches;
pub mod sessions;

pub use batches::BatchRepo;
pub use sessions::SessionRepo;
