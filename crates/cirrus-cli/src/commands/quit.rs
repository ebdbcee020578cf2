//! The quit command: unmounts a running instance.

use std::path::Path;

use crate::{CliError, EXIT_MOUNT};

pub fn run(mountpoint: &Path) -> Result<(), CliError> {
    if !mountpoint.exists() {
        return Err(CliError::new(
            EXIT_MOUNT,
            format!("mount point {} does not exist", mountpoint.display()),
        ));
    }
    for tool in ["fusermount3", "fusermount"] {
        if let Ok(status) = std::process::Command::new(tool)
            .arg("-u")
            .arg(mountpoint)
            .status()
        {
            if status.success() {
                println!("unmounted {}", mountpoint.display());
                return Ok(());
            }
        }
    }
    Err(CliError::new(
        EXIT_MOUNT,
        format!("could not unmount {}", mountpoint.display()),
    ))
}
