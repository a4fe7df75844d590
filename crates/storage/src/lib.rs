//! Storage backends and backend instance management for Depot.
//!
//! This crate provides:
//! - The uniform [`StorageBackend`] contract, multipart uploads included
//! - Backends: local filesystem and S3-compatible
//! - A build-time registry of platforms and a validating instance factory
//! - A per-tenant instance cache and the process-wide default backend
//! - [`StorageFacade`], which resolves a request to its backend

pub mod backends;
pub mod cache;
pub mod default;
pub mod error;
pub mod facade;
pub mod factory;
pub mod registry;
pub mod traits;

pub use backends::{local::LocalBackend, s3::S3Backend};
pub use cache::InstanceCache;
pub use default::DefaultBackendManager;
pub use error::{StorageError, StorageResult};
pub use facade::StorageFacade;
pub use factory::InstanceFactory;
pub use registry::{BackendPrototype, PlatformInfo, PlatformRegistration, PluginRegistry};
pub use traits::{ByteStream, CompletedPart, PartInfo, StorageBackend, bytes_stream, collect_stream};
