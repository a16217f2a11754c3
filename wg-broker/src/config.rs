// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading the daemon's TOML configuration file and
//! validating its contents. Every field has a default, so an empty file
//! yields a working Linux setup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub backend: BackendConfig,
    pub firewall: FirewallSettings,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Log file mirrored from stderr, cleared by the `clearLogs` call
    pub log_file: Option<PathBuf>,
    /// Bootstrap socket, session sockets and rendered tunnel configs
    pub runtime_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            runtime_dir: PathBuf::from("/run/wg-broker"),
        }
    }
}

/// Tunnel backend options
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub wg_quick: String,
    /// Exported as WG_QUICK_USERSPACE_IMPLEMENTATION
    pub userspace_implementation: Option<String>,
    pub uapi_socket_dir: PathBuf,
    /// Persistent keepalive sent with every peer update (seconds)
    pub keepalive_interval: u16,
    pub monitor_routes: bool,
    /// Backend liveness poll period (seconds)
    pub health_check_interval: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            wg_quick: "wg-quick".to_string(),
            userspace_implementation: None,
            uapi_socket_dir: PathBuf::from("/var/run/wireguard"),
            keepalive_interval: 25,
            monitor_routes: true,
            health_check_interval: 5,
        }
    }
}

/// Packet filter selection
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackendKind {
    /// Platform default chosen at build time
    #[default]
    Auto,
    Iptables,
    Pf,
    None,
}

/// Firewall options
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FirewallSettings {
    pub backend: FirewallBackendKind,
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.runtime_dir.as_os_str().is_empty() {
        anyhow::bail!("runtime_dir cannot be empty");
    }

    if config.general.log_level.parse::<log::LevelFilter>().is_err() {
        anyhow::bail!("Invalid log_level: {}", config.general.log_level);
    }

    if config.backend.wg_quick.is_empty() {
        anyhow::bail!("wg_quick cannot be empty");
    }

    if config.backend.keepalive_interval == 0 {
        anyhow::bail!("keepalive_interval must be > 0");
    }

    if config.backend.health_check_interval == 0 {
        anyhow::bail!("health_check_interval must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.runtime_dir, PathBuf::from("/run/wg-broker"));
        assert_eq!(config.backend.keepalive_interval, 25);
        assert!(config.backend.monitor_routes);
        assert_eq!(config.firewall.backend, FirewallBackendKind::Auto);
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [general]
            log_level = "debug"
            log_file = "/var/log/wg-broker.log"
            runtime_dir = "/tmp/wgb"

            [backend]
            wg_quick = "/usr/bin/wg-quick"
            userspace_implementation = "wireguard-go"
            keepalive_interval = 60
            monitor_routes = false

            [firewall]
            backend = "iptables"
            "#,
        )
        .unwrap();

        assert!(validate_config(&config).is_ok());
        assert_eq!(config.general.log_file, Some(PathBuf::from("/var/log/wg-broker.log")));
        assert_eq!(
            config.backend.userspace_implementation.as_deref(),
            Some("wireguard-go")
        );
        assert_eq!(config.backend.keepalive_interval, 60);
        assert!(!config.backend.monitor_routes);
        assert_eq!(config.firewall.backend, FirewallBackendKind::Iptables);
    }

    #[test]
    fn test_validate_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());

        // Zero keepalive
        let mut bad_config = config.clone();
        bad_config.backend.keepalive_interval = 0;
        assert!(validate_config(&bad_config).is_err());

        // Zero health check
        let mut bad_config = config.clone();
        bad_config.backend.health_check_interval = 0;
        assert!(validate_config(&bad_config).is_err());

        // Unknown log level
        let mut bad_config = config.clone();
        bad_config.general.log_level = "chatty".to_string();
        assert!(validate_config(&bad_config).is_err());

        // Empty runtime dir
        let mut bad_config = config.clone();
        bad_config.general.runtime_dir = PathBuf::new();
        assert!(validate_config(&bad_config).is_err());
    }

    #[test]
    fn test_unknown_firewall_backend_rejected() {
        let result: Result<Config, _> = toml::from_str("[firewall]\nbackend = \"wfp\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backend]\nhealth_check_interval = 2").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backend.health_check_interval, 2);

        assert!(load_config("/nonexistent/wg-broker.toml").is_err());
    }
}
