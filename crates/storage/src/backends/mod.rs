//! Destination backends.

pub mod filesystem;
pub mod http;
