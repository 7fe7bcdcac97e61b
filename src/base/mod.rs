//! This module contains base types that are used across the lock manager.
//!
//! - [`OwnerId`]: An opaque identity of whoever holds or waits for a lock, e.g. a transaction.
//! - [`HlmError`]: The crate wide error type, with [`HlmResult`] as its result alias.

use std::sync::Arc;

pub mod error;

pub use error::*;

/// Identifies the owner of a lock request, e.g. a transaction or a replica.
///
/// Owners are only ever compared for equality. Cloning is cheap, since the underlying string is
/// reference counted and shared between every request of the same owner.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[debug("OwnerId({_0:?})")]
pub struct OwnerId(Arc<str>);

impl OwnerId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for owners without any visible identity, which are rejected on acquire.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for OwnerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl From<u64> for OwnerId {
    fn from(id: u64) -> Self {
        Self::new(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_id_equality_is_by_value() {
        let a = OwnerId::from("txn-1");
        let b = OwnerId::from(String::from("txn-1"));
        assert_eq!(a, b);
        assert_ne!(a, OwnerId::from("txn-2"));
        assert_eq!(OwnerId::from(7u64).as_str(), "7");
    }

    #[test]
    fn test_owner_id_blank_is_empty() {
        assert!(OwnerId::from("").is_empty());
        assert!(OwnerId::from("  \t").is_empty());
        assert!(!OwnerId::from("a").is_empty());
    }
}
