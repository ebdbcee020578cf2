//! Subcommand implementations.

pub mod auth;
pub mod inspect;
pub mod mount;
pub mod quit;
