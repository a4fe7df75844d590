pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{local_config, seeded_bytes, sha256_hex};
#[allow(unused_imports)]
pub use mocks::CountingBackend;
