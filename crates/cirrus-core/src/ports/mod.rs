//! Capability interfaces implemented outside the core
//!
//! Exactly two dynamic-dispatch seams exist: the remote API client
//! ([`remote::RemoteDrive`]) and the bearer-token provider
//! ([`auth::TokenSource`]). Both are injected at mount construction so
//! tests can substitute in-memory fakes; everything else in the workspace
//! is wired concretely.

pub mod auth;
pub mod remote;

pub use auth::TokenSource;
pub use remote::{
    ChildPage, ChunkOutcome, ConflictBehavior, DeltaPage, DownloadOutcome, ItemPatch,
    Reachability, RemoteDrive, RemoteItem, UploadSessionInfo, UploadTarget,
};
