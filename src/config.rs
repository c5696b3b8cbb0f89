//! Configuration management for ftpscout
//!
//! Handles loading, saving, and locating the TOML configuration.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use ipnetwork::Ipv4Network;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub ftp: FtpConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory for the index and registry files (not serialized)
    #[serde(skip)]
    pub data_dir: PathBuf,
}

/// Network discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Subnet handed to nmap, CIDR notation
    #[serde(default = "default_subnet")]
    pub subnet: String,

    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Addresses never scanned
    #[serde(default)]
    pub blacklist: Vec<Ipv4Addr>,

    /// Only addresses matching this regex from their first character are
    /// kept (optional)
    #[serde(default)]
    pub valid_address_pattern: Option<String>,

    /// An address let through is ignored for this long
    #[serde(default = "default_drop_duplicate_timeout")]
    pub drop_duplicate_timeout_secs: u64,

    /// Timeout of the TCP liveness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Capacity of the queue between discovery and the indexer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_nmap_binary")]
    pub nmap_binary: String,

    /// Run nmap through sudo for a SYN scan
    #[serde(default)]
    pub use_sudo: bool,

    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

/// Per-server indexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// A server is rescanned at most this often
    #[serde(default = "default_min_update_interval")]
    pub min_update_interval_secs: u64,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Extensions that get tag extraction
    #[serde(default = "default_audio_extensions")]
    pub audio_extensions: Vec<String>,

    #[serde(default = "default_true")]
    pub optimize_on_commit: bool,

    /// Forget servers offline for this many days (optional)
    #[serde(default)]
    pub purge_offline_after_days: Option<u64>,
}

/// FTP client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    #[serde(default = "default_ftp_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
}

/// Storage locations; default to files in the data directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    #[serde(default)]
    pub registry_path: Option<PathBuf>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Log level, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_subnet() -> String {
    "192.168.1.0/24".to_string()
}

fn default_scan_interval() -> u64 {
    300
}

fn default_drop_duplicate_timeout() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    100
}

fn default_nmap_binary() -> String {
    "nmap".to_string()
}

fn default_scan_timeout() -> u64 {
    600
}

fn default_min_update_interval() -> u64 {
    3600
}

fn default_max_depth() -> usize {
    50
}

fn default_audio_extensions() -> Vec<String> {
    vec!["mp3".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_ftp_port() -> u16 {
    21
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            subnet: default_subnet(),
            scan_interval_secs: default_scan_interval(),
            blacklist: Vec::new(),
            valid_address_pattern: None,
            drop_duplicate_timeout_secs: default_drop_duplicate_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            queue_capacity: default_queue_capacity(),
            nmap_binary: default_nmap_binary(),
            use_sudo: false,
            scan_timeout_secs: default_scan_timeout(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            min_update_interval_secs: default_min_update_interval(),
            max_depth: default_max_depth(),
            audio_extensions: default_audio_extensions(),
            optimize_on_commit: true,
            purge_offline_after_days: None,
        }
    }
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            port: default_ftp_port(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let (config_path, data_dir) = Self::get_default_paths();
        Self {
            discovery: DiscoveryConfig::default(),
            indexer: IndexerConfig::default(),
            ftp: FtpConfig::default(),
            storage: StorageConfig::default(),
            service: ServiceConfig::default(),
            config_path,
            data_dir,
        }
    }
}

impl DiscoveryConfig {
    /// Compiled address pattern, `None` when validation is off.
    ///
    /// The pattern is anchored at the start of the address; the end is left
    /// to the pattern itself.
    pub fn address_pattern(&self) -> Result<Option<Regex>> {
        self.valid_address_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})", pattern))
                    .with_context(|| format!("Invalid valid_address_pattern: {:?}", pattern))
            })
            .transpose()
    }

    /// The subnet to scan, in CIDR notation
    pub fn subnet(&self) -> Result<Ipv4Network> {
        self.subnet
            .parse()
            .with_context(|| format!("Invalid subnet: {:?}", self.subnet))
    }
}

impl FtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl Config {
    /// Get default paths for the config file and data directory
    fn get_default_paths() -> (PathBuf, PathBuf) {
        if let Some(proj_dirs) = ProjectDirs::from("org", "ftpscout", "ftpscout") {
            (
                proj_dirs.config_dir().join("config.toml"),
                proj_dirs.data_dir().to_path_buf(),
            )
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            (
                PathBuf::from(&home).join(".config/ftpscout/config.toml"),
                PathBuf::from(&home).join(".local/share/ftpscout"),
            )
        }
    }

    /// Load configuration from `path` (or the default location), writing a
    /// default file if none exists yet
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (default_path, data_dir) = Self::get_default_paths();
        let config_path = path.map(Path::to_path_buf).unwrap_or(default_path);

        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;
            config.config_path = config_path;
            config.data_dir = data_dir;
            config
        } else {
            info!("Config file not found, creating default at {:?}", config_path);
            let config = Config {
                config_path,
                data_dir,
                ..Config::default()
            };
            config.save()?;
            config
        };

        config.discovery.address_pattern()?;
        config.discovery.subnet()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        fs::write(&self.config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", self.config_path))?;

        info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage
            .index_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("index.db"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage
            .registry_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("registry.db"))
    }
}
