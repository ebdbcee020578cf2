//! Configuration for CirrusFS.
//!
//! A flat set of recognized options loaded from a YAML file, with defaults
//! and validation. Interval and timeout fields are plain seconds; byte
//! sizes are plain bytes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::CoreError;

/// Server-required alignment for upload-session chunks (320 KiB).
pub const CHUNK_ALIGNMENT: u64 = 320 * 1024;

/// Recognized configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Identifier of the remote drive to project.
    pub drive_id: String,
    /// Per-user state directory: holds the metadata store, `content/`,
    /// `tmp/`, `logs/`, and the IPC `service` file.
    pub cache_dir: PathBuf,
    /// Content-cache capacity in bytes; clean entries beyond it are evicted.
    pub cache_max_bytes: u64,
    /// Uploads at or below this size take the single-PUT path (bytes).
    pub small_upload_cutoff: u64,
    /// Chunk size for session uploads (bytes); rounded down to the
    /// server-required alignment at session time.
    pub chunk_size: u64,
    /// Short delta poll interval (seconds); forced whenever the push
    /// notifier is failed or missing.
    pub delta_interval_active: u64,
    /// Long delta poll interval (seconds); stretched further while the
    /// push notifier reports healthy.
    pub delta_interval_idle: u64,
    /// Retry budget for a single upload session.
    pub upload_max_retries: u32,
    /// Ceiling for exponential upload backoff (seconds).
    pub upload_backoff_cap: u64,
    /// Per-request timeout for remote calls (seconds).
    pub request_timeout: u64,
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub log_level: String,
    /// Path of the bearer-token file maintained by the auth subsystem.
    pub auth_token_path: PathBuf,
    /// Whether to expose the D-Bus status service.
    pub ipc_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
        let state = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("cirrusfs");
        Self {
            mount_point: home.join("CirrusFS"),
            drive_id: "me".to_string(),
            cache_dir: state.clone(),
            cache_max_bytes: 4 * 1024 * 1024 * 1024,
            small_upload_cutoff: 4 * 1024 * 1024,
            chunk_size: 10 * 1024 * 1024,
            delta_interval_active: 5,
            delta_interval_idle: 60,
            upload_max_retries: 5,
            upload_backoff_cap: 300,
            request_timeout: 60,
            log_level: "info".to_string(),
            auth_token_path: state.join("auth_tokens.json"),
            ipc_enabled: true,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Tries to load from `path`; falls back to [`Config::default`] when
    /// the file is absent. A present-but-broken file is an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cirrusfs/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cirrusfs")
            .join("config.yaml")
    }

    /// Rejects configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.drive_id.is_empty() {
            return Err(CoreError::Invalid("drive_id must not be empty".into()));
        }
        if self.cache_max_bytes == 0 {
            return Err(CoreError::Invalid("cache_max_bytes must be positive".into()));
        }
        if self.small_upload_cutoff == 0 {
            return Err(CoreError::Invalid(
                "small_upload_cutoff must be positive".into(),
            ));
        }
        if self.chunk_size < CHUNK_ALIGNMENT {
            return Err(CoreError::Invalid(format!(
                "chunk_size must be at least {CHUNK_ALIGNMENT} bytes"
            )));
        }
        if self.delta_interval_active == 0 || self.delta_interval_idle == 0 {
            return Err(CoreError::Invalid(
                "delta intervals must be positive".into(),
            ));
        }
        if self.request_timeout == 0 {
            return Err(CoreError::Invalid("request_timeout must be positive".into()));
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(CoreError::Invalid(format!(
                "unknown log_level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// The per-request deadline for remote calls.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Path of the embedded metadata store.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("state.db")
    }

    /// Directory of cached file bodies.
    pub fn content_dir(&self) -> PathBuf {
        self.cache_dir.join("content")
    }

    /// Staging directory for in-progress downloads; entries are atomically
    /// renamed into `content/`.
    pub fn tmp_dir(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// Directory for log files.
    pub fn logs_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    /// File advertising the IPC endpoint address.
    pub fn service_file(&self) -> PathBuf {
        self.cache_dir.join("service")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.small_upload_cutoff, 4 * 1024 * 1024);
        assert_eq!(config.chunk_size % CHUNK_ALIGNMENT, 0);
    }

    #[test]
    fn test_state_dir_layout() {
        let mut config = Config::default();
        config.cache_dir = PathBuf::from("/var/lib/cirrusfs");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/cirrusfs/state.db"));
        assert_eq!(
            config.content_dir(),
            PathBuf::from("/var/lib/cirrusfs/content")
        );
        assert_eq!(config.tmp_dir(), PathBuf::from("/var/lib/cirrusfs/tmp"));
        assert_eq!(
            config.service_file(),
            PathBuf::from("/var/lib/cirrusfs/service")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.drive_id = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.chunk_size = 1024; // below alignment
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.delta_interval_active = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "drive_id: b!abc123\nsmall_upload_cutoff: 1048576\nlog_level: debug\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.drive_id, "b!abc123");
        assert_eq!(config.small_upload_cutoff, 1048576);
        assert_eq!(config.log_level, "debug");
        // unspecified fields keep their defaults
        assert_eq!(config.upload_max_retries, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_load_rejects_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "chunk_size: [not, a, number]\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
