//! The inspect command: dumps sync state from the state database.
//!
//! Reads are safe against a running daemon (WAL journal mode).

use cirrus_core::config::Config;
use cirrus_store::{DatabasePool, MetadataStore};

use crate::{CliError, EXIT_STORAGE};

pub fn run(config: Config) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;

    runtime.block_on(async {
        let pool = DatabasePool::open(&config.db_path())
            .await
            .map_err(|e| CliError::new(EXIT_STORAGE, format!("cannot open state: {e}")))?;
        let store = MetadataStore::new(&pool);

        let counts = store
            .status_counts()
            .await
            .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;
        let uploads = store
            .all_uploads()
            .await
            .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;
        let cursor = store
            .get_delta_cursor(&config.drive_id)
            .await
            .map_err(|e| CliError::new(EXIT_STORAGE, e.to_string()))?;

        println!("drive:        {}", config.drive_id);
        println!("state db:     {}", config.db_path().display());
        println!("delta cursor: {}", if cursor.is_some() { "present" } else { "none" });
        println!();

        println!("inodes by status:");
        if counts.is_empty() {
            println!("  (none)");
        }
        for (status, count) in counts {
            println!("  {status:<16} {count}");
        }
        println!();

        println!("upload journal: {} session(s)", uploads.len());
        for session in uploads {
            println!(
                "  {:<44} {:?} {:?} offset {}/{} retries {}",
                session.item_id.as_str(),
                session.priority,
                session.state,
                session.offset,
                session.total,
                session.retries,
            );
            if let Some(error) = session.error {
                println!("    last error: {error}");
            }
        }
        Ok(())
    })
}
