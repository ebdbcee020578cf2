//! CirrusFS command-line interface.
//!
//! `mount` runs the daemon in the foreground until the filesystem is
//! unmounted; `quit` unmounts a running instance; `auth` reports token
//! health; `inspect` dumps queue depths and status counts from the state
//! database.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cirrus_core::config::Config;

/// Exit code for configuration problems.
pub const EXIT_CONFIG: u8 = 2;
/// Exit code for authentication problems.
pub const EXIT_AUTH: u8 = 3;
/// Exit code for mount failures.
pub const EXIT_MOUNT: u8 = 4;
/// Exit code for local storage failures.
pub const EXIT_STORAGE: u8 = 5;

/// A failed command with its process exit code.
pub struct CliError {
    pub code: u8,
    pub message: String,
}

impl CliError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Parser)]
#[command(name = "cirrusfs", version, about = "On-demand cloud drive filesystem")]
struct Cli {
    /// Path to the configuration file (default: XDG config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the drive and run the sync daemon in the foreground
    Mount {
        /// Mount point; overrides the configured one
        mountpoint: Option<PathBuf>,
        /// Drive identifier; overrides the configured one
        #[arg(long)]
        drive: Option<String>,
    },
    /// Unmount a running instance
    Quit {
        /// Mount point; overrides the configured one
        mountpoint: Option<PathBuf>,
    },
    /// Check the stored authentication tokens
    Auth,
    /// Dump queue depths and per-status inode counts
    Inspect,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, CliError> {
    let path = path.cloned().unwrap_or_else(Config::default_path);
    Config::load_or_default(&path)
        .map_err(|e| CliError::new(EXIT_CONFIG, format!("configuration error: {e}")))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Mount { mountpoint, drive } => load_config(cli.config.as_ref()).and_then(
            |mut config| {
                if let Some(mountpoint) = mountpoint {
                    config.mount_point = mountpoint.clone();
                }
                if let Some(drive) = drive {
                    config.drive_id = drive.clone();
                }
                commands::mount::run(config)
            },
        ),
        Command::Quit { mountpoint } => load_config(cli.config.as_ref()).and_then(|config| {
            let target = mountpoint.clone().unwrap_or(config.mount_point);
            commands::quit::run(&target)
        }),
        Command::Auth => load_config(cli.config.as_ref()).and_then(commands::auth::run),
        Command::Inspect => load_config(cli.config.as_ref()).and_then(commands::inspect::run),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("cirrusfs: {}", error.message);
            ExitCode::from(error.code)
        }
    }
}
