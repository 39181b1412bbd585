//! Configuration management for Scrivener
//!
//! This module handles loading, parsing, and validating configuration
//! from a YAML file with serde defaults for every field.

use crate::error::{Result, ScrivenerError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Scrivener
///
/// Holds all configuration for the core: quota enforcement, session
/// lifecycle, collaborator call bounds, and storage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Quota and tier configuration
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// External collaborator call bounds
    #[serde(default)]
    pub collaborators: CollaboratorConfig,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Quota enforcement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Monthly request ceiling for standard-tier users
    #[serde(default = "default_monthly_limit")]
    pub monthly_request_limit: u32,

    /// Admin user ids (can manage VIPs and bans, always VIP themselves)
    #[serde(default)]
    pub admin_users: Vec<i64>,

    /// VIP user ids granted by configuration (unlimited requests)
    #[serde(default)]
    pub vip_users: Vec<i64>,
}

fn default_monthly_limit() -> u32 {
    100
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            monthly_request_limit: default_monthly_limit(),
            admin_users: Vec::new(),
            vip_users: Vec::new(),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hours of inactivity before a session is expired
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,

    /// Maximum recent turns included in the planner context
    #[serde(default = "default_max_context_turns")]
    pub max_context_turns: usize,

    /// Minutes between expiry sweeps (advisory for the embedder)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_minutes: u64,
}

fn default_timeout_hours() -> u64 {
    1
}

fn default_max_context_turns() -> usize {
    10
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_hours: default_timeout_hours(),
            max_context_turns: default_max_context_turns(),
            cleanup_interval_minutes: default_cleanup_interval(),
        }
    }
}

/// Bounds for external collaborator calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Timeout for a language-model call (seconds)
    #[serde(default = "default_model_timeout")]
    pub model_timeout_seconds: u64,

    /// Timeout for a renderer apply/export call (seconds)
    #[serde(default = "default_render_timeout")]
    pub render_timeout_seconds: u64,
}

fn default_model_timeout() -> u64 {
    120
}

fn default_render_timeout() -> u64 {
    60
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            model_timeout_seconds: default_model_timeout(),
            render_timeout_seconds: default_render_timeout(),
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Explicit database path; defaults to the platform data directory.
    /// The `SCRIVENER_DB` environment variable overrides both.
    #[serde(default)]
    pub db_path: Option<String>,

    /// Attempts for a committed-state persistence write before the turn
    /// is surfaced as fatal
    #[serde(default = "default_persist_attempts")]
    pub persist_retry_attempts: u32,

    /// Days of activity-log history to retain
    #[serde(default = "default_activity_retention")]
    pub activity_retention_days: u32,
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_activity_retention() -> u32 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            persist_retry_attempts: default_persist_attempts(),
            activity_retention_days: default_activity_retention(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// Missing files yield the default configuration so the admin CLI
    /// works out of the box.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ScrivenerError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ScrivenerError::Config(format!("failed to parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ScrivenerError::Config` when a limit or timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.quota.monthly_request_limit == 0 {
            return Err(
                ScrivenerError::Config("quota.monthly_request_limit must be > 0".into()).into(),
            );
        }
        if self.session.timeout_hours == 0 {
            return Err(ScrivenerError::Config("session.timeout_hours must be > 0".into()).into());
        }
        if self.collaborators.model_timeout_seconds == 0 {
            return Err(ScrivenerError::Config(
                "collaborators.model_timeout_seconds must be > 0".into(),
            )
            .into());
        }
        if self.storage.persist_retry_attempts == 0 {
            return Err(ScrivenerError::Config(
                "storage.persist_retry_attempts must be > 0".into(),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota.monthly_request_limit, 100);
        assert_eq!(config.session.timeout_hours, 1);
        assert_eq!(config.collaborators.model_timeout_seconds, 120);
        assert_eq!(config.storage.persist_retry_attempts, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/scrivener.yaml").expect("load failed");
        assert_eq!(config.quota.monthly_request_limit, 100);
    }

    #[test]
    fn test_load_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "quota:\n  monthly_request_limit: 25\n  admin_users: [42]"
        )
        .expect("write");

        let config = Config::load(file.path()).expect("load failed");
        assert_eq!(config.quota.monthly_request_limit, 25);
        assert_eq!(config.quota.admin_users, vec![42]);
        // Untouched sections keep their defaults
        assert_eq!(config.session.max_context_turns, 10);
        assert_eq!(config.storage.activity_retention_days, 30);
    }

    #[test]
    fn test_load_invalid_yaml_fails() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "quota: [not a map").expect("write");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = Config::default();
        config.quota.monthly_request_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.session.timeout_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retry_attempts() {
        let mut config = Config::default();
        config.storage.persist_retry_attempts = 0;
        assert!(config.validate().is_err());
    }
}
