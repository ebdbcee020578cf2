//! The mount command: constructs the core, serves IPC, mounts, and runs
//! until unmounted.

use std::path::Path;
use std::process::Command as ProcessCommand;
use std::sync::Arc;

use cirrus_core::config::Config;
use cirrus_fs::{Filesystem, FilesystemOptions};
use cirrus_graph::{ClientConfig, FileTokenSource, GraphClient, GraphDrive};
use cirrus_store::DatabasePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{CliError, EXIT_AUTH, EXIT_CONFIG, EXIT_MOUNT, EXIT_STORAGE};

pub fn run(config: Config) -> Result<(), CliError> {
    init_tracing(&config);

    std::fs::create_dir_all(&config.cache_dir)
        .and_then(|_| std::fs::create_dir_all(config.logs_dir()))
        .map_err(|e| CliError::new(EXIT_STORAGE, format!("cannot create state dir: {e}")))?;
    std::fs::create_dir_all(&config.mount_point)
        .map_err(|e| CliError::new(EXIT_MOUNT, format!("cannot create mount point: {e}")))?;

    // fail fast on missing credentials before any mounting happens
    let tokens = Arc::new(FileTokenSource::new(config.auth_token_path.clone()));
    tokens
        .load()
        .map_err(|e| CliError::new(EXIT_AUTH, e.to_string()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::new(EXIT_CONFIG, format!("cannot start runtime: {e}")))?;

    let quit = CancellationToken::new();
    let fs = runtime
        .block_on(async {
            let pool = DatabasePool::open(&config.db_path()).await?;
            let client = GraphClient::new(
                tokens.clone(),
                &ClientConfig {
                    timeout: config.request_timeout(),
                    ..ClientConfig::default()
                },
            );
            let remote = Arc::new(GraphDrive::new(client, config.drive_id.clone()));
            let fs = Filesystem::new(
                FilesystemOptions {
                    config: config.clone(),
                },
                &pool,
                remote,
                tokens.clone(),
            )
            .await?;
            fs.start();
            Ok::<Arc<Filesystem>, anyhow::Error>(fs)
        })
        .map_err(|e| CliError::new(EXIT_STORAGE, format!("cannot open state: {e}")))?;

    if config.ipc_enabled {
        let ipc_fs = Arc::clone(&fs);
        let ipc_quit = quit.clone();
        let service_file = config.service_file();
        runtime.spawn(async move {
            match cirrus_ipc::serve(ipc_fs, ipc_quit).await {
                Ok(_connection) => {
                    if let Err(error) = cirrus_ipc::write_service_file(&service_file) {
                        warn!(%error, "could not write service file");
                    }
                    // the connection lives as long as the daemon; keep it
                    std::future::pending::<()>().await;
                }
                Err(error) => {
                    // non-fatal: the xattr surface still exposes status
                    warn!(%error, "status bus unavailable, continuing without IPC");
                }
            }
        });
    }

    // Ctrl-C or a D-Bus Quit unmounts, which makes fuser::mount2 return
    let unmount_target = config.mount_point.clone();
    let signal_quit = quit.clone();
    runtime.spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, unmounting"),
            _ = signal_quit.cancelled() => info!("quit requested, unmounting"),
        }
        unmount(&unmount_target);
    });

    info!(
        mountpoint = %config.mount_point.display(),
        drive = %config.drive_id,
        "mounting"
    );
    let mount_result = cirrus_fuse::mount(Arc::clone(&fs), runtime.handle().clone(), &config.mount_point);

    quit.cancel();
    runtime.block_on(fs.stop());

    mount_result.map_err(|e| {
        error!(%e, "mount session failed");
        CliError::new(EXIT_MOUNT, format!("mount failed: {e}"))
    })
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Asks the kernel to detach the mount; mount2 returns once it does.
pub(crate) fn unmount(mountpoint: &Path) {
    for tool in ["fusermount3", "fusermount"] {
        match ProcessCommand::new(tool).arg("-u").arg(mountpoint).status() {
            Ok(status) if status.success() => return,
            Ok(_) | Err(_) => continue,
        }
    }
    warn!(mountpoint = %mountpoint.display(), "fusermount did not unmount");
}
