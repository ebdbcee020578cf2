//! The auth command: reports the health of the stored tokens.
//!
//! The interactive OAuth flow lives in a separate helper; this command
//! only verifies what it left behind at `auth_token_path`.

use cirrus_core::config::Config;
use cirrus_graph::FileTokenSource;

use crate::{CliError, EXIT_AUTH};

pub fn run(config: Config) -> Result<(), CliError> {
    let source = FileTokenSource::new(config.auth_token_path.clone());
    let tokens = source
        .load()
        .map_err(|e| CliError::new(EXIT_AUTH, e.to_string()))?;

    println!("token file:  {}", config.auth_token_path.display());
    println!("client id:   {}", tokens.client_id);
    println!("expires at:  {}", tokens.expires_at.to_rfc3339());
    if tokens.needs_refresh() {
        println!("state:       expired (will refresh on next use)");
    } else {
        let remaining = tokens.expires_at - chrono::Utc::now();
        println!("state:       valid ({} min remaining)", remaining.num_minutes());
    }
    Ok(())
}
