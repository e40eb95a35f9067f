//! TOML-based configuration for a discovery node.
//!
//! A [`DiscoveryConfig`] can be loaded from any path with [`load_config`];
//! when no path is given the binary looks in the platform config directory:
//! - Windows:  `%APPDATA%\Beacon\config.toml`
//! - Linux:    `~/.config/beacon/config.toml`
//! - macOS:    `~/Library/Application Support/Beacon/config.toml`
//!
//! Example:
//!
//! ```toml
//! port = 12345
//! multicast = "239.1.2.3"
//! key = "shared secret"
//! weight = 0.9
//! node_timeout_ms = 4000
//! master_timeout_ms = 6000
//! ```
//!
//! # Serde default values
//!
//! Every field is annotated with `#[serde(default ...)]`, so an empty file
//! (or no file at all) yields a working configuration.  Options that are
//! genuinely optional (`broadcast`, `multicast`, `key`, `weight`,
//! `host_name`) are `Option`s and are omitted from serialized output when
//! unset.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use beacon_core::domain::membership::SettingsError;
use beacon_core::protocol::wrap::HEADER_SIZE;
use beacon_core::{ElectionSettings, IgnoreMode, PipelineConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::infrastructure::network::udp::UdpMode;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Timing or quorum settings violate the election constraints.
    #[error("invalid election settings: {0}")]
    Election(#[from] SettingsError),

    /// Any other invalid option.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema ─────────────────────────────────────────────────────────────

/// Everything a discovery node can be configured with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Local address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_address")]
    pub address: String,
    /// UDP port shared by every node on the segment.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit broadcast address; the limited broadcast when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    /// Multicast group.  Mutually exclusive with `broadcast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast: Option<String>,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    /// Shared passphrase; unset disables encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default = "default_hello_interval_ms")]
    pub hello_interval_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default = "default_master_timeout_ms")]
    pub master_timeout_ms: u64,
    #[serde(default = "default_masters_required")]
    pub masters_required: usize,
    /// Election tie-breaker; random in `[0, 1)` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Swallow decode, checksum, and timeout errors instead of publishing them.
    #[serde(default = "default_true")]
    pub ignore_data_errors: bool,
    /// Datagram size including the fragment header.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
    /// Which of our own broadcasts to drop: `"self"`, `"process"`, or `"none"`.
    #[serde(default)]
    pub ignore: IgnoreMode,
    /// Host name reported to peers; the local host name when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    12345
}
fn default_multicast_ttl() -> u32 {
    1
}
fn default_hello_interval_ms() -> u64 {
    1000
}
fn default_check_interval_ms() -> u64 {
    2000
}
fn default_node_timeout_ms() -> u64 {
    2000
}
fn default_master_timeout_ms() -> u64 {
    2000
}
fn default_masters_required() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_block_size() -> usize {
    1500
}
fn default_block_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            broadcast: None,
            multicast: None,
            multicast_ttl: default_multicast_ttl(),
            key: None,
            hello_interval_ms: default_hello_interval_ms(),
            check_interval_ms: default_check_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            master_timeout_ms: default_master_timeout_ms(),
            masters_required: default_masters_required(),
            weight: None,
            ignore_data_errors: default_true(),
            block_size: default_block_size(),
            block_timeout_ms: default_block_timeout_ms(),
            ignore: IgnoreMode::default(),
            host_name: None,
            log_level: default_log_level(),
        }
    }
}

// ── Validation and conversions ────────────────────────────────────────────────

impl DiscoveryConfig {
    /// Checks every constraint a node relies on.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Election`] for interval ordering or quorum violations,
    /// [`ConfigError::Invalid`] for everything else.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hello_interval_ms == 0 || self.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "hello and check intervals must be non-zero".to_string(),
            ));
        }
        self.election_settings().validate()?;
        if self.block_size <= HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size must exceed the {HEADER_SIZE}-byte fragment header, got {}",
                self.block_size
            )));
        }
        if let Some(weight) = self.weight {
            if !weight.is_finite() {
                return Err(ConfigError::Invalid(format!("weight must be finite, got {weight}")));
            }
        }
        self.bind_address()?;
        self.udp_mode()?;
        Ok(())
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms)
    }

    pub fn election_settings(&self) -> ElectionSettings {
        ElectionSettings {
            check_interval: Duration::from_millis(self.check_interval_ms),
            node_timeout: Duration::from_millis(self.node_timeout_ms),
            master_timeout: Duration::from_millis(self.master_timeout_ms),
            masters_required: self.masters_required,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            key: self.key.clone(),
            block_size: self.block_size,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            ignore: self.ignore,
        }
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `address` is not an IP address.
    pub fn bind_address(&self) -> Result<IpAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bind address '{}'", self.address)))
    }

    /// Resolves `broadcast` / `multicast` into a socket mode.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if both are set, if either is not an IPv4
    /// address, or if the multicast address is outside `224.0.0.0/4`.
    pub fn udp_mode(&self) -> Result<UdpMode, ConfigError> {
        match (&self.broadcast, &self.multicast) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "broadcast and multicast are mutually exclusive".to_string(),
            )),
            (None, Some(group)) => {
                let group = parse_ipv4("multicast", group)?;
                if !group.is_multicast() {
                    return Err(ConfigError::Invalid(format!(
                        "{group} is not a multicast group address"
                    )));
                }
                Ok(UdpMode::Multicast {
                    group,
                    ttl: self.multicast_ttl,
                })
            }
            (Some(destination), None) => Ok(UdpMode::Broadcast {
                destination: parse_ipv4("broadcast", destination)?,
            }),
            (None, None) => Ok(UdpMode::default()),
        }
    }
}

fn parse_ipv4(option: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid {option} address '{value}'")))
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path in the platform config directory.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads a [`DiscoveryConfig`] from `path`, returning the defaults if the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<DiscoveryConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DiscoveryConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Loads from `path` when there is one, otherwise returns the defaults.
///
/// `None` stands for "no config location could be resolved", e.g. when
/// [`config_file_path`] fails because `HOME` is unset.
///
/// # Errors
///
/// As [`load_config`] when `path` is given.
pub fn load_config_or_default(path: Option<&Path>) -> Result<DiscoveryConfig, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            warn!("no config location available; using defaults");
            Ok(DiscoveryConfig::default())
        }
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &DiscoveryConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `Beacon` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Beacon"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("beacon"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Beacon")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("beacon_test_{}", Uuid::new_v4()))
            .join("config.toml")
    }

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_config_matches_documented_defaults() {
        // Arrange / Act
        let cfg = DiscoveryConfig::default();

        // Assert
        assert_eq!(cfg.address, "0.0.0.0");
        assert_eq!(cfg.port, 12345);
        assert_eq!(cfg.multicast_ttl, 1);
        assert_eq!(cfg.hello_interval_ms, 1000);
        assert_eq!(cfg.check_interval_ms, 2000);
        assert_eq!(cfg.node_timeout_ms, 2000);
        assert_eq!(cfg.master_timeout_ms, 2000);
        assert_eq!(cfg.masters_required, 1);
        assert!(cfg.ignore_data_errors);
        assert_eq!(cfg.block_size, 1500);
        assert_eq!(cfg.block_timeout_ms, 5000);
        assert_eq!(cfg.ignore, IgnoreMode::Instance);
        assert!(cfg.key.is_none());
        assert!(cfg.weight.is_none());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DiscoveryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: DiscoveryConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, DiscoveryConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides_defaults() {
        // Arrange
        let toml_str = r#"
port = 9999
multicast = "239.0.0.7"
ignore = "process"
weight = 0.75
"#;

        // Act
        let cfg: DiscoveryConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.multicast.as_deref(), Some("239.0.0.7"));
        assert_eq!(cfg.ignore, IgnoreMode::Process);
        assert_eq!(cfg.weight, Some(0.75));
        assert_eq!(cfg.block_size, 1500);
    }

    #[test]
    fn test_unset_options_are_omitted_from_toml() {
        let toml_str = toml::to_string_pretty(&DiscoveryConfig::default()).expect("serialize");

        assert!(!toml_str.contains("key"), "None key must be omitted");
        assert!(!toml_str.contains("multicast ="), "None multicast must be omitted");
        assert!(!toml_str.contains("weight"), "None weight must be omitted");
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn test_validate_rejects_node_timeout_below_check_interval() {
        let cfg = DiscoveryConfig {
            check_interval_ms: 5000,
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Election(
                SettingsError::NodeTimeoutBelowCheckInterval { .. }
            ))
        ));
    }

    #[test]
    fn test_validate_rejects_master_timeout_below_node_timeout() {
        let cfg = DiscoveryConfig {
            master_timeout_ms: 1000,
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Election(
                SettingsError::MasterTimeoutBelowNodeTimeout { .. }
            ))
        ));
    }

    #[test]
    fn test_validate_rejects_block_size_at_header_size() {
        let cfg = DiscoveryConfig {
            block_size: 36,
            ..DiscoveryConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_hello_interval() {
        let cfg = DiscoveryConfig {
            hello_interval_ms: 0,
            ..DiscoveryConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_broadcast_with_multicast() {
        let cfg = DiscoveryConfig {
            broadcast: Some("192.168.1.255".to_string()),
            multicast: Some("239.1.2.3".to_string()),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_unicast_multicast_group() {
        let cfg = DiscoveryConfig {
            multicast: Some("10.0.0.1".to_string()),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_bind_address() {
        let cfg = DiscoveryConfig {
            address: "not-an-ip".to_string(),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    // ── Conversions ───────────────────────────────────────────────────────────

    #[test]
    fn test_udp_mode_resolution() {
        let broadcast = DiscoveryConfig {
            broadcast: Some("192.168.1.255".to_string()),
            ..DiscoveryConfig::default()
        };
        let multicast = DiscoveryConfig {
            multicast: Some("239.1.2.3".to_string()),
            multicast_ttl: 4,
            ..DiscoveryConfig::default()
        };

        assert_eq!(
            broadcast.udp_mode().unwrap(),
            UdpMode::Broadcast {
                destination: Ipv4Addr::new(192, 168, 1, 255)
            }
        );
        assert_eq!(
            multicast.udp_mode().unwrap(),
            UdpMode::Multicast {
                group: Ipv4Addr::new(239, 1, 2, 3),
                ttl: 4
            }
        );
        assert_eq!(DiscoveryConfig::default().udp_mode().unwrap(), UdpMode::default());
    }

    #[test]
    fn test_pipeline_and_election_conversions() {
        // Arrange
        let cfg = DiscoveryConfig {
            key: Some("k".to_string()),
            block_size: 512,
            block_timeout_ms: 750,
            node_timeout_ms: 3000,
            master_timeout_ms: 9000,
            masters_required: 2,
            ..DiscoveryConfig::default()
        };

        // Act
        let pipeline = cfg.pipeline_config();
        let election = cfg.election_settings();

        // Assert
        assert_eq!(pipeline.key.as_deref(), Some("k"));
        assert_eq!(pipeline.block_size, 512);
        assert_eq!(pipeline.block_timeout, Duration::from_millis(750));
        assert_eq!(election.node_timeout, Duration::from_millis(3000));
        assert_eq!(election.master_timeout, Duration::from_millis(9000));
        assert_eq!(election.masters_required, 2);
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/path/that/cannot/exist/config.toml");

        let cfg = load_config(&path).expect("missing file yields defaults");

        assert_eq!(cfg, DiscoveryConfig::default());
    }

    #[test]
    fn test_load_config_or_default_without_location_uses_defaults() {
        let cfg = load_config_or_default(None).expect("defaults");

        assert_eq!(cfg, DiscoveryConfig::default());
    }

    #[test]
    fn test_load_config_or_default_reads_given_path() {
        // Arrange
        let path = temp_path();
        let cfg = DiscoveryConfig {
            port: 34567,
            ..DiscoveryConfig::default()
        };
        save_config(&path, &cfg).expect("save");

        // Act
        let loaded = load_config_or_default(Some(&path)).expect("load");

        // Assert
        assert_eq!(loaded.port, 34567);
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_save_and_load_config_round_trip() {
        // Arrange
        let path = temp_path();
        let cfg = DiscoveryConfig {
            port: 23456,
            key: Some("secret".to_string()),
            weight: Some(0.25),
            log_level: "debug".to_string(),
            ..DiscoveryConfig::default()
        };

        // Act
        save_config(&path, &cfg).expect("save");
        let loaded = load_config(&path).expect("load");

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_load_config_reports_parse_error() {
        // Arrange
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        // Act
        let result = load_config(&path);

        // Assert
        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
