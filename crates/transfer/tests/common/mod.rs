//! Common test utilities for transfer integration tests.

pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{Harness, fast_config, init_request, seeded_bytes, sha256_hex, split_chunks};
#[allow(unused_imports)]
pub use mocks::{CallCounts, INSTRUMENTED_PLATFORM, instrumented_config, instrumented_registration};
