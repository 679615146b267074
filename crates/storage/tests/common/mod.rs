pub mod fake_upstream;
pub mod fixtures;

#[allow(unused_imports)]
pub use fake_upstream::{FakeUpstream, TOKEN};
#[allow(unused_imports)]
pub use fixtures::seeded_bytes;
