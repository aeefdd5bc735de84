//! Layered configuration for the cadence daemon.
//!
//! Settings resolve in order: built-in defaults → `cadence.toml` →
//! `CADENCE_*` environment variables → CLI flags. The file is optional;
//! a missing file just means defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 4780
//! dev_mode = false
//!
//! [scheduler]
//! tick_interval_secs = 30
//!
//! [database]
//! path = ".cadence/cadence.db"
//!
//! [log]
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::server::ServerConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CadenceConfig {
    pub server: ServerSection,
    pub scheduler: SchedulerSection,
    pub database: DatabaseSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 4780,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".cadence/cadence.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LogSection {
    pub json: bool,
}

impl CadenceConfig {
    /// Load configuration from a file (or `cadence.toml` in the working
    /// directory), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("cadence.toml"));
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CADENCE_*` overrides from an arbitrary lookup (injectable
    /// for tests). Unparseable values are ignored in favor of the current
    /// setting.
    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = get("CADENCE_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(dev) = get("CADENCE_DEV_MODE").and_then(|v| v.parse().ok()) {
            self.server.dev_mode = dev;
        }
        if let Some(secs) = get("CADENCE_TICK_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.scheduler.tick_interval_secs = secs;
        }
        if let Some(path) = get("CADENCE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(json) = get("CADENCE_LOG_JSON").and_then(|v| v.parse().ok()) {
            self.log.json = json;
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs.max(1))
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.server.port,
            db_path: self.database.path.clone(),
            tick_interval: self.tick_interval(),
            dev_mode: self.server.dev_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CadenceConfig::default();
        assert_eq!(config.server.port, 4780);
        assert_eq!(config.scheduler.tick_interval_secs, 30);
        assert_eq!(config.database.path, PathBuf::from(".cadence/cadence.db"));
        assert!(!config.log.json);
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let config: CadenceConfig = toml::from_str(
            r#"
            [server]
            port = 9999

            [scheduler]
            tick_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert_eq!(config.database.path, PathBuf::from(".cadence/cadence.db"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = CadenceConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("CADENCE_PORT", "8123"),
            ("CADENCE_DB_PATH", "/var/lib/cadence/db.sqlite"),
            ("CADENCE_LOG_JSON", "true"),
        ]);
        config.apply_env_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8123);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/cadence/db.sqlite"));
        assert!(config.log.json);
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let mut config = CadenceConfig::default();
        config.apply_env_from(|key| (key == "CADENCE_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.port, 4780);
    }

    #[test]
    fn test_tick_interval_never_zero() {
        let mut config = CadenceConfig::default();
        config.scheduler.tick_interval_secs = 0;
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = CadenceConfig::load(Some(Path::new("/nonexistent/cadence.toml"))).unwrap();
        assert_eq!(config.server.port, 4780);
    }

    #[test]
    fn test_server_config_conversion() {
        let mut config = CadenceConfig::default();
        config.server.port = 4000;
        config.scheduler.tick_interval_secs = 7;
        let server = config.server_config();
        assert_eq!(server.port, 4000);
        assert_eq!(server.tick_interval, Duration::from_secs(7));
    }
}
