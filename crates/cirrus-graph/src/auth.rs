//! File-backed bearer tokens.
//!
//! The interactive OAuth flow is owned by an external subsystem; it leaves
//! a token file at the configured `auth_token_path`. This module reads
//! that file, serves bearer tokens from it, and performs the
//! refresh-token grant when the access token expires or the remote
//! rejects it.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use cirrus_core::domain::CoreError;
use cirrus_core::ports::TokenSource;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default token endpoint for the common tenant.
const TOKEN_ENDPOINT: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Scopes requested on refresh.
const SCOPES: &str = "Files.ReadWrite.All offline_access";

/// Refresh this long before the recorded expiry.
const EXPIRY_SLACK_SECS: i64 = 300;

/// Persisted token file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    /// Bearer token for API requests
    pub access_token: String,
    /// Long-lived token used to mint new access tokens
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
    /// Application (client) id the tokens were issued to
    pub client_id: String,
    /// Token endpoint; defaults to the common tenant
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

impl StoredTokens {
    /// True once the access token is (nearly) expired.
    pub fn needs_refresh(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_SLACK_SECS) >= self.expires_at
    }
}

/// Wire format of the refresh-token grant response
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

/// [`TokenSource`] backed by a JSON token file
pub struct FileTokenSource {
    path: PathBuf,
    http: reqwest::Client,
    cached: RwLock<Option<StoredTokens>>,
}

impl FileTokenSource {
    /// Creates a source reading from (and writing back to) `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            http: reqwest::Client::new(),
            cached: RwLock::new(None),
        }
    }

    /// Loads and validates the token file.
    pub fn load(&self) -> Result<StoredTokens, CoreError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            CoreError::PermissionDenied(format!(
                "cannot read token file {}: {e}; run `cirrusfs auth` first",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::Invalid(format!("malformed token file: {e}")))
    }

    async fn tokens(&self) -> Result<StoredTokens, CoreError> {
        if let Some(tokens) = self.cached.read().await.clone() {
            return Ok(tokens);
        }
        let tokens = self.load()?;
        *self.cached.write().await = Some(tokens.clone());
        Ok(tokens)
    }

    /// Runs the refresh-token grant and persists the new tokens.
    async fn do_refresh(&self, tokens: &StoredTokens) -> Result<StoredTokens, CoreError> {
        let endpoint = tokens
            .token_endpoint
            .as_deref()
            .unwrap_or(TOKEN_ENDPOINT)
            .to_string();
        debug!("refreshing access token");

        let params = [
            ("client_id", tokens.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", tokens.refresh_token.as_str()),
            ("scope", SCOPES),
        ];
        let response = self
            .http
            .post(&endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| CoreError::Transient(format!("token refresh transport error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::PermissionDenied(format!(
                "token refresh rejected ({status}): {body}"
            )));
        }

        let grant: RefreshResponse = response
            .json()
            .await
            .map_err(|e| CoreError::Transient(format!("malformed token response: {e}")))?;

        let refreshed = StoredTokens {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or_else(|| tokens.refresh_token.clone()),
            expires_at: Utc::now() + Duration::seconds(grant.expires_in),
            client_id: tokens.client_id.clone(),
            token_endpoint: tokens.token_endpoint.clone(),
        };

        let serialized = serde_json::to_string_pretty(&refreshed)
            .map_err(|e| CoreError::Invalid(format!("cannot serialize tokens: {e}")))?;
        std::fs::write(&self.path, serialized)
            .map_err(|e| CoreError::Storage(format!("cannot persist token file: {e}")))?;

        *self.cached.write().await = Some(refreshed.clone());
        info!("access token refreshed");
        Ok(refreshed)
    }
}

#[async_trait::async_trait]
impl TokenSource for FileTokenSource {
    async fn bearer(&self) -> Result<String, CoreError> {
        let tokens = self.tokens().await?;
        if tokens.needs_refresh() {
            return Ok(self.do_refresh(&tokens).await?.access_token);
        }
        Ok(tokens.access_token)
    }

    async fn refresh(&self) -> Result<String, CoreError> {
        let tokens = self.tokens().await?;
        Ok(self.do_refresh(&tokens).await?.access_token)
    }
}
