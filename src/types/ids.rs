//! Newtype wrappers for engine identifiers.
//!
//! These types prevent accidental mixing of the different strings the engine
//! passes around (a replica name where a work-item discriminator is expected,
//! for instance) and make signatures self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one running replica of the hosting service.
///
/// Used as the suffix of the replica's persisted state key, so it must be
/// stable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(s: impl Into<String>) -> Self {
        ReplicaId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        ReplicaId(s.to_string())
    }
}

/// The discriminator carried in the `type` field of every serialized work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemType(pub String);

impl WorkItemType {
    pub fn new(s: impl Into<String>) -> Self {
        WorkItemType(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkItemType {
    fn from(s: &str) -> Self {
        WorkItemType(s.to_string())
    }
}

impl From<String> for WorkItemType {
    fn from(s: String) -> Self {
        WorkItemType(s)
    }
}

impl AsRef<str> for WorkItemType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies the holder of a mutex lease.
///
/// Each acquisition gets a fresh random id, so a lease can only be released
/// by the scope that acquired it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(pub String);

impl HolderId {
    /// Generates a new random holder id.
    pub fn generate() -> Self {
        HolderId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
