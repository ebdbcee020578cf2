//! Extended-attribute surface.
//!
//! A small fixed set of attributes exposes per-file sync state to file
//! managers that do not speak the IPC bus, plus two write-only controls
//! (pin and force-refresh).

/// Read-only: the file-status enum value (`cloud`, `cached`, …).
pub const XATTR_STATUS: &str = "user.cirrusfs.status";

/// Read-only: the QuickXOR content hash (base64), empty if unknown.
pub const XATTR_HASH: &str = "user.cirrusfs.hash";

/// Read/write: `1` pins the file (kept cached), `0` unpins.
pub const XATTR_PIN: &str = "user.cirrusfs.pin";

/// Write-only: any value forces a metadata refresh from the remote.
pub const XATTR_REFRESH: &str = "user.cirrusfs.refresh";

/// Attributes visible to `listxattr`.
pub fn listable() -> &'static [&'static str] {
    &[XATTR_STATUS, XATTR_HASH, XATTR_PIN]
}

/// True for names this filesystem handles at all.
pub fn is_known(name: &str) -> bool {
    matches!(
        name,
        XATTR_STATUS | XATTR_HASH | XATTR_PIN | XATTR_REFRESH
    )
}
