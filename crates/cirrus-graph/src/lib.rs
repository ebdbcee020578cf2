//! CirrusFS Graph API adapter
//!
//! Implements the [`cirrus_core::ports::RemoteDrive`] port over the
//! Microsoft Graph HTTP/JSON API: typed item metadata, children paging,
//! conditional downloads, small and resumable uploads, metadata patches,
//! the delta change feed, and a connectivity probe.
//!
//! Retry policy lives *above* this crate in the transfer managers; here
//! every HTTP status is mapped once onto a distinct
//! [`cirrus_core::domain::CoreError`] kind and returned.

pub mod auth;
pub mod client;
pub mod delta;
pub mod items;
pub mod provider;
pub mod upload;

pub use auth::FileTokenSource;
pub use client::{ClientConfig, GraphClient};
pub use provider::GraphDrive;
