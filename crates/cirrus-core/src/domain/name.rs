//! Name folding and validation
//!
//! The remote is case-preserving but case-insensitive. Child uniqueness and
//! path resolution therefore compare *folded* names: NFC normalization of
//! Unicode followed by ASCII-only lowercasing, matching the remote's
//! definition. This is implemented explicitly; host filesystem behavior is
//! never consulted.

use chrono::{DateTime, Utc};
use unicode_normalization::UnicodeNormalization;

use super::errors::CoreError;

/// Maximum file name length in bytes (POSIX NAME_MAX).
const NAME_MAX: usize = 255;

/// Characters the remote rejects in item names.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Produces the comparison key for an item name.
///
/// NFC-normalizes the string and lowercases ASCII letters only. Two names
/// are "the same" within a folder exactly when their folded forms are equal.
pub fn fold_name(name: &str) -> String {
    name.nfc()
        .map(|c| {
            if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                c
            }
        })
        .collect()
}

/// Validates an item name against the remote's naming rules.
///
/// # Errors
///
/// Returns `CoreError::Invalid` for empty names, `.`/`..`, names over
/// NAME_MAX bytes, embedded NUL, and the remote's forbidden characters.
pub fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Invalid("empty name".to_string()));
    }
    if name == "." || name == ".." {
        return Err(CoreError::Invalid(format!("reserved name: {name}")));
    }
    if name.len() > NAME_MAX {
        return Err(CoreError::Invalid(format!(
            "name exceeds {NAME_MAX} bytes"
        )));
    }
    if name.contains('\0') {
        return Err(CoreError::Invalid("name contains NUL".to_string()));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(CoreError::Invalid(format!(
            "name contains forbidden character {c:?}"
        )));
    }
    Ok(())
}

/// Builds the sidestep name used when a conflicting local copy is preserved.
///
/// The timestamp keeps repeated conflicts on the same file distinguishable.
pub fn conflict_name(name: &str, when: DateTime<Utc>) -> String {
    format!("{} (conflict {})", name, when.format("%Y-%m-%d %H%M%S"))
}
