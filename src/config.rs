//! Server configuration.
//!
//! Settings are read from `.crm/crm.toml` (or `--config <path>`) and
//! layered as: defaults → file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! db_path = ".crm/crm.db"
//! dev_mode = false
//!
//! [pagination]
//! default_page_size = 20
//! max_page_size = 100
//!
//! [logging]
//! filter = "info"
//! format = "pretty"
//! ```
//!
//! Environment overrides: `CRM_HOST`, `CRM_PORT`, `CRM_DB_PATH`, `CRM_LOG`,
//! `CRM_LOG_FORMAT`. A `.env` file in the working directory is loaded first.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".crm/crm.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS and binding on all interfaces.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".crm/crm.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

impl ServerSection {
    /// Address to bind. Dev mode listens on every interface.
    pub fn bind_addr(&self) -> String {
        let host = if self.dev_mode { "0.0.0.0" } else { self.host.as_str() };
        format!("{}:{}", host, self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationSection {
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

fn default_page_size() -> u32 {
    20
}

fn default_max_page_size() -> u32 {
    100
}

impl Default for PaginationSection {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSection {
    /// `tracing` EnvFilter directive, e.g. `info,crm=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Contents of `crm.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrmConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pagination: PaginationSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Flags given on the command line; `None` keeps the lower layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev_mode: bool,
}

impl CrmConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse crm.toml")
    }

    /// Load `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize crm.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CRM_*` variables. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CRM_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CRM_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid CRM_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("CRM_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(filter) = lookup("CRM_LOG") {
            self.logging.filter = filter;
        }
        if let Some(format) = lookup("CRM_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(path) = &cli.db_path {
            self.server.db_path = path.clone();
        }
        if cli.dev_mode {
            self.server.dev_mode = true;
        }
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        let p = &self.pagination;
        if p.default_page_size == 0 {
            errors.push("pagination.default_page_size must be at least 1".to_string());
        }
        if p.default_page_size > p.max_page_size {
            errors.push(format!(
                "pagination.default_page_size ({}) exceeds max_page_size ({})",
                p.default_page_size, p.max_page_size
            ));
        }
        errors
    }

    /// Resolve the effective configuration for a process: file (if any),
    /// then `.env` and the environment, then CLI flags. Fails on invalid
    /// settings.
    pub fn resolve(config_path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(DEFAULT_CONFIG_PATH))?,
        };
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);

        let errors = config.validate();
        if !errors.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CrmConfig::default();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.server.db_path, PathBuf::from(".crm/crm.db"));
        assert_eq!(config.pagination.default_page_size, 20);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = CrmConfig::parse(
            r#"
            [server]
            port = 8080

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.pagination.max_page_size, 100);
    }

    #[test]
    fn test_env_then_cli_layering() {
        let env: HashMap<&str, &str> = [
            ("CRM_PORT", "9000"),
            ("CRM_DB_PATH", "/tmp/env.db"),
            ("CRM_LOG", "debug"),
            ("CRM_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();
        let mut config = CrmConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.filter, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        config.apply_cli(&CliOverrides {
            port: Some(7000),
            dev_mode: true,
            ..Default::default()
        });
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/env.db"));
        assert_eq!(config.server.bind_addr(), "0.0.0.0:7000");
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let mut config = CrmConfig::default();
        let result = config.apply_env(|k| (k == "CRM_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_page_sizes() {
        let mut config = CrmConfig::default();
        config.pagination.default_page_size = 500;
        config.server.port = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("max_page_size")));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crm.toml");
        let mut config = CrmConfig::default();
        config.server.port = 4000;
        config.save(&path).unwrap();
        assert_eq!(CrmConfig::load(&path).unwrap(), config);
        assert_eq!(CrmConfig::load_or_default(&dir.path().join("missing.toml")).unwrap(), CrmConfig::default());
    }
}
