//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
///
/// Provider SDK errors are translated into these variants at the backend
/// boundary and never leak past it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("configuration error for platform '{platform}': {message}")]
    Configuration { platform: String, message: String },

    #[error("unknown storage platform: {0}")]
    UnknownPlatform(String),

    #[error("storage platform '{platform}' is a prototype and cannot perform I/O")]
    Unconfigured { platform: String },

    #[error("storage backend '{platform}' has been closed")]
    Closed { platform: String },
}

impl StorageError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout(_) => "timeout",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidRange(_) => "invalid_range",
            Self::InvalidPart(_) => "invalid_part",
            Self::Io(_) => "io_error",
            Self::Provider(_) => "provider_error",
            Self::Configuration { .. } => "configuration_error",
            Self::UnknownPlatform(_) => "unknown_platform",
            Self::Unconfigured { .. } => "unconfigured",
            Self::Closed { .. } => "closed",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub(crate) fn configuration(platform: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            platform: platform.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
