use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_callback_host() -> String {
    "127.0.0.1".to_string()
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_max_poll_attempts() -> u32 {
    300
}

fn default_close_grace_secs() -> u64 {
    3
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_refresh_window_secs() -> u64 {
    300
}

fn default_scope() -> String {
    "openid profile email offline_access".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

/// Timing and endpoint knobs for the login flow and token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default = "default_callback_host")]
    pub callback_host: String,
    /// 0 binds an ephemeral port.
    #[serde(default)]
    pub callback_port: u16,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            callback_host: default_callback_host(),
            callback_port: 0,
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
            close_grace_secs: default_close_grace_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            refresh_window_secs: default_refresh_window_secs(),
            scope: default_scope(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the credential database location.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmsdesk")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cmsdesk")
    }

    pub fn ensure_dirs() -> Result<()> {
        std::fs::create_dir_all(Self::config_dir())?;
        std::fs::create_dir_all(Self::data_dir())?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("credentials.db"))
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.auth.poll_interval_secs, 1);
        assert_eq!(config.auth.max_poll_attempts, 300);
        assert_eq!(config.auth.close_grace_secs, 3);
        assert_eq!(config.auth.callback_port, 0);
        assert!(config.auth.scope.contains("offline_access"));
    }

    #[test]
    fn partial_auth_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            callback_port = 8765
            refresh_window_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.callback_port, 8765);
        assert_eq!(config.auth.refresh_window_secs, 60);
        assert_eq!(config.auth.session_ttl_secs, 300);
        assert_eq!(config.auth.callback_host, "127.0.0.1");
    }

    #[test]
    fn database_path_override() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            database_path = "/tmp/creds.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/creds.db"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.auth.http_timeout_secs = 5;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.auth.http_timeout_secs, 5);
    }
}
