//! HTTP request handlers.

pub mod batches;
pub mod common;
pub mod system;
pub mod uploads;
pub mod ws;

pub use batches::*;
pub use common::*;
pub use system::*;
pub use uploads::*;
pub use ws::*;
