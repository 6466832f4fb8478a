//! Configuration management for Tallycast

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How often the daemon syncs every active source (humantime, e.g. "6h")
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Sources synced concurrently; defaults to the number of CPUs
    #[serde(default)]
    pub workers: Option<usize>,

    /// Attempts per request when an upstream keeps throttling
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Environment variable holding the passphrase used to encrypt stored secrets
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_interval() -> String {
    "6h".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_user_agent() -> String {
    format!("tallycast/{}", env!("CARGO_PKG_VERSION"))
}

fn default_key_env() -> String {
    "TALLYCAST_ENCRYPTION_KEY".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            workers: None,
            max_retries: default_max_retries(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Result<Duration> {
        let interval = humantime::parse_duration(&self.interval).map_err(|e| ConfigError::Invalid {
            field: "sync.interval".to_string(),
            message: e.to_string(),
        })?;

        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "sync.interval".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        Ok(interval)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.sync.interval()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/tallycast/tallycast.db".to_string(),
            },
            sync: SyncConfig::default(),
            http: HttpConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// Resolve the configuration file path under the XDG config directory
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TALLYCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("tallycast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[database]\npath = \"/tmp/tally.db\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.database.path, "/tmp/tally.db");
        assert_eq!(config.sync.interval().unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.http.timeout(), Duration::from_secs(600));
        assert_eq!(config.credentials.key_env, "TALLYCAST_ENCRYPTION_KEY");
        assert!(config.sync.worker_count() >= 1);
    }

    #[test]
    fn test_full_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[database]
path = "~/data/tally.db"

[sync]
interval = "30m"
workers = 3
max_retries = 2

[http]
timeout_secs = 60
user_agent = "custom-agent/1.0"

[credentials]
key_env = "MY_KEY"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.sync.interval().unwrap(), Duration::from_secs(1800));
        assert_eq!(config.sync.worker_count(), 3);
        assert_eq!(config.sync.max_retries, 2);
        assert_eq!(config.http.user_agent, "custom-agent/1.0");
        assert_eq!(config.credentials.key_env, "MY_KEY");
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[database]\npath = \"x.db\"\n\n[sync]\ninterval = \"soon\"\n",
        )
        .unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("sync.interval"));
    }

    #[test]
    fn test_missing_database_section_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[sync]\ninterval = \"1h\"\n").unwrap();

        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn test_zero_workers_clamped() {
        let sync = SyncConfig {
            workers: Some(0),
            ..SyncConfig::default()
        };
        assert_eq!(sync.worker_count(), 1);
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var("TALLYCAST_CONFIG", "/tmp/custom/tallycast.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("TALLYCAST_CONFIG");
        assert_eq!(path, PathBuf::from("/tmp/custom/tallycast.toml"));
    }

    #[test]
    #[serial]
    fn test_config_path_default() {
        std::env::remove_var("TALLYCAST_CONFIG");
        let path = resolve_config_path().unwrap();
        assert!(path.ends_with("tallycast/config.toml"));
    }
}
