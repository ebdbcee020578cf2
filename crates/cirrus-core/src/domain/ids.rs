//! Identifier newtypes
//!
//! Item ids are server-assigned opaque strings. Before the first successful
//! upload, locally created items carry a distinguishable local-only id
//! (`local-<uuid>`); the upload manager remaps the inode to the server id
//! when the create completes.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known id of the root inode until the first delta supplies the
/// server-assigned drive-root id.
pub const ROOT_ID: &str = "root";

/// Prefix marking an id that has not yet been allocated by the server.
const LOCAL_PREFIX: &str = "local-";

/// Opaque identifier of a drive item (file, folder, or package)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wraps a server-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a fresh local-only id for a not-yet-uploaded item.
    #[must_use]
    pub fn new_local() -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, Uuid::new_v4()))
    }

    /// Returns the well-known root id.
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    /// True if this id was assigned locally and is still pending upload.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a remote drive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(String);

impl DriveId {
    /// Wraps a drive identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DriveId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_is_distinguishable() {
        let local = ItemId::new_local();
        assert!(local.is_local());
        assert!(local.as_str().starts_with("local-"));

        let remote = ItemId::new("01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K");
        assert!(!remote.is_local());
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = ItemId::new_local();
        let b = ItemId::new_local();
        assert_ne!(a, b);
    }

    #[test]
    fn test_root_id() {
        let root = ItemId::root();
        assert_eq!(root.as_str(), ROOT_ID);
        assert!(!root.is_local());
    }

    #[test]
    fn test_serde_transparent() {
        let id = ItemId::new("ABC123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ABC123\"");

        let back: ItemId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
