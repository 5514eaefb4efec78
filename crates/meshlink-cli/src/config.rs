//! Configuration file for the meshlink CLI.

use meshlink_relay::{RelayClientConfig, RelayServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// meshlink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Broker settings
    pub relay: RelayServerConfig,
    /// Broker client settings
    pub client: RelayClientConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Default location for `init-config`
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("meshlink.toml")
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.relay.max_sessions == 0 {
            anyhow::bail!("relay.max_sessions must be at least 1");
        }

        if self.relay.idle_timeout.is_zero() {
            anyhow::bail!("relay.idle_timeout_ms must be positive");
        }

        if self.relay.max_payload < 1500 {
            anyhow::bail!("relay.max_payload must hold at least one 1500-byte packet");
        }

        if self.client.keepalive_interval >= self.relay.idle_timeout {
            anyhow::bail!(
                "client.keepalive_interval_ms ({:?}) must be shorter than relay.idle_timeout_ms ({:?})",
                self.client.keepalive_interval,
                self.relay.idle_timeout
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.listen.port(), 8080);
        assert_eq!(config.relay.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.relay.max_sessions = 0;
        assert!(config.validate().is_err());

        config.relay.max_sessions = 10;
        config.client.keepalive_interval = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            listen = "127.0.0.1:9000"
            idle_timeout_ms = 4000

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.listen.port(), 9000);
        assert_eq!(config.relay.idle_timeout, Duration::from_secs(4));
        assert_eq!(config.relay.max_sessions, 10_000);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/meshlink.toml");

        let mut config = Config::default();
        config.relay.require_key = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.relay.require_key);
        assert_eq!(loaded.relay.listen, config.relay.listen);
    }
}
