//! CirrusFS IPC status service
//!
//! Exposes the per-file status stream and a synchronous status query on
//! the session D-Bus so desktop integrations (file-manager emblems,
//! tray indicators) can follow synchronization state. When the bus is
//! unavailable the daemon logs and continues; the xattr surface remains
//! as a fallback.

pub mod service;

pub use service::{serve, write_service_file, DBUS_NAME, DBUS_PATH};
