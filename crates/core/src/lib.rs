//! Core domain types and shared logic for the Depot transfer engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Transfer task identity, chunk plan and lifecycle state machine
//! - Storage backend configuration and cache keys
//! - Explicit per-request context
//! - Content hashing
//! - Application configuration

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod storage_config;
pub mod task;

pub use context::RequestContext;
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use storage_config::{DEFAULT_PLATFORM, StorageConfig};
pub use task::{ChunkPlan, TaskId, TaskStatus, TransferTask};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Maximum length of a persisted task error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;
