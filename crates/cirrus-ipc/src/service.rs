//! D-Bus interface implementation.
//!
//! One interface at a well-known name:
//!
//! - `FileStatusChanged(path, status)` - signal fed from the in-process
//!   status bus
//! - `GetFileStatus(path) → status` - synchronous query
//! - `Quit()` - orderly unmount request
//!
//! The endpoint address is written to the state directory's `service`
//! file so integrations can discover it without hardcoding.

use std::path::Path;
use std::sync::Arc;

use cirrus_fs::Filesystem;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::object_server::SignalContext;

/// D-Bus well-known name of the CirrusFS daemon.
pub const DBUS_NAME: &str = "com.enigmora.CirrusFS";

/// D-Bus object path of the status service.
pub const DBUS_PATH: &str = "/com/enigmora/CirrusFS";

/// The exported interface.
pub struct StatusInterface {
    fs: Arc<Filesystem>,
    quit: CancellationToken,
}

#[zbus::interface(name = "com.enigmora.CirrusFS.Status")]
impl StatusInterface {
    /// Returns the file-status enum value for a mount-relative path, or
    /// `"unknown"` when the path does not resolve.
    async fn get_file_status(&self, path: String) -> String {
        match self.fs.status_by_path(&path) {
            Ok(status) => status.as_str().to_string(),
            Err(error) => {
                debug!(%path, %error, "GetFileStatus miss");
                "unknown".to_string()
            }
        }
    }

    /// Asks the daemon to unmount and exit.
    async fn quit(&self) {
        info!("Quit requested over D-Bus");
        self.quit.cancel();
    }

    /// Emitted on every file-status transition.
    #[zbus(signal)]
    async fn file_status_changed(
        ctxt: &SignalContext<'_>,
        path: String,
        status: String,
    ) -> zbus::Result<()>;
}

/// Claims the well-known name, serves the interface, and forwards the
/// status bus onto the signal until `shutdown` fires.
pub async fn serve(
    fs: Arc<Filesystem>,
    shutdown: CancellationToken,
) -> zbus::Result<zbus::Connection> {
    let interface = StatusInterface {
        fs: Arc::clone(&fs),
        quit: shutdown.clone(),
    };
    let connection = zbus::connection::Builder::session()?
        .name(DBUS_NAME)?
        .serve_at(DBUS_PATH, interface)?
        .build()
        .await?;
    info!(name = DBUS_NAME, "status service online");

    let mut events = fs.status_bus().subscribe();
    let signal_connection = connection.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let ctxt = match SignalContext::new(&signal_connection, DBUS_PATH) {
                            Ok(ctxt) => ctxt,
                            Err(error) => {
                                warn!(%error, "signal context unavailable");
                                continue;
                            }
                        };
                        if let Err(error) = StatusInterface::file_status_changed(
                            &ctxt,
                            event.path.clone(),
                            event.status.as_str().to_string(),
                        )
                        .await
                        {
                            debug!(%error, "could not emit FileStatusChanged");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "status signal stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("status signal forwarder stopped");
    });

    Ok(connection)
}

/// Records the endpoint address in the state directory so integrations
/// can discover the service.
pub fn write_service_file(path: &Path) -> std::io::Result<()> {
    let contents = format!("dbus:{DBUS_NAME}\npath:{DBUS_PATH}\n");
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service");
        write_service_file(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("dbus:com.enigmora.CirrusFS"));
        assert!(contents.contains("path:/com/enigmora/CirrusFS"));
    }
}
