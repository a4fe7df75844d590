//! Storage backend implementations.

pub mod local;
pub mod s3;

use crate::error::{StorageError, StorageResult};
use crate::registry::PlatformRegistration;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::sync::atomic::{AtomicBool, Ordering};

/// Characters left unescaped inside one key segment.
const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Registration table of the platforms compiled into this crate.
pub fn builtin_registrations() -> Vec<PlatformRegistration> {
    vec![local::registration(), s3::registration()]
}

/// Open/closed state shared by every configured backend.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    platform: &'static str,
    closed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new(platform: &'static str) -> Self {
        Self {
            platform,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed {
                platform: self.platform.to_string(),
            });
        }
        Ok(())
    }

    /// Mark closed. Returns true only for the call that performed the close.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Percent-encode a key for use in a URL path, keeping `/` separators.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, KEY_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an optional `public_url` property.
pub(crate) fn validate_public_url(value: Option<&str>) -> Result<(), String> {
    match value {
        Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
            Err(format!("public_url must be an http(s) URL, got '{url}'"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(encode_key("u1/2024-01-01/a b.txt"), "u1/2024-01-01/a%20b.txt");
        assert_eq!(encode_key("ü/x"), "%C3%BC/x");
    }

    #[test]
    fn test_lifecycle_closes_once() {
        let lifecycle = Lifecycle::new("local");
        assert!(lifecycle.ensure_open().is_ok());
        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert!(matches!(
            lifecycle.ensure_open(),
            Err(StorageError::Closed { .. })
        ));
    }

    #[test]
    fn test_builtin_registrations_are_unique() {
        let registrations = builtin_registrations();
        let mut names: Vec<_> = registrations.iter().map(|r| r.platform).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names, vec!["local", "s3"]);
    }
}
