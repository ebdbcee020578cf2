//! Storage error classification

use cirrus_core::domain::CoreError;
use thiserror::Error;

/// Errors surfaced by the metadata store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The disk or database file is out of space
    #[error("storage full")]
    Full,

    /// The database file failed integrity checks or a record failed to
    /// deserialize
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    /// Another connection holds a conflicting lock past the busy timeout
    #[error("storage locked")]
    Locked,

    /// Could not open or migrate the database
    #[error("storage connection failed: {0}")]
    Connection(String),

    /// Any other query failure
    #[error("storage query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // SQLite primary result codes: 5 = BUSY, 6 = LOCKED, 11 =
            // CORRUPT, 13 = FULL; extended codes carry the primary code
            // in the low byte
            if let Some(code) = db.code().and_then(|c| c.parse::<i64>().ok()) {
                match code & 0xFF {
                    5 | 6 => return StoreError::Locked,
                    11 => return StoreError::Corrupt(db.message().to_string()),
                    13 => return StoreError::Full,
                    _ => {}
                }
            }
        }
        StoreError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(format!("record deserialization failed: {err}"))
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_error_maps_to_corrupt() {
        let bad: Result<cirrus_core::domain::Inode, _> = serde_json::from_str("{broken");
        let err: StoreError = bad.unwrap_err().into();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_store_error_surfaces_as_storage_kind() {
        let core: CoreError = StoreError::Full.into();
        assert!(matches!(core, CoreError::Storage(_)));
    }
}
