use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "sonic-sabotage";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HandoffConfig {
    #[serde(default = "default_ssid")]
    pub ssid: String,
    /// Time the device needs to raise its AP after switching to update mode.
    #[serde(default = "default_ap_start_delay_ms")]
    pub ap_start_delay_ms: u64,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// How many "connected" reports one join produces (Android reports two).
    #[serde(default = "default_connect_events_per_join")]
    pub connect_events_per_join: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TransferConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sleep before every connection attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Pause between opening the socket and sending the header.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DownloadConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SabotageConfig {
    /// Mirror log output into this directory when set.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

fn default_ssid() -> String {
    "DTCAP".to_string()
}
fn default_ap_start_delay_ms() -> u64 {
    5000
}
fn default_join_timeout_secs() -> u64 {
    120
}
fn default_connect_events_per_join() -> u32 {
    1
}
fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
}
fn default_port() -> u16 {
    5000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    8000
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_chunk_size() -> usize {
    8192
}
fn default_base_url() -> String {
    "https://detourne.tech/fw".to_string()
}
fn default_file_name() -> String {
    "dbuzz.bin".to_string()
}
fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            ssid: default_ssid(),
            ap_start_delay_ms: default_ap_start_delay_ms(),
            join_timeout_secs: default_join_timeout_secs(),
            connect_events_per_join: default_connect_events_per_join(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            file_name: default_file_name(),
            download_dir: default_download_dir(),
        }
    }
}

impl HandoffConfig {
    pub fn ap_start_delay(&self) -> Duration {
        Duration::from_millis(self.ap_start_delay_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl TransferConfig {
    pub fn device_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl DownloadConfig {
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.file_name)
    }

    pub fn destination(&self) -> PathBuf {
        self.download_dir.join(&self.file_name)
    }
}

/// `<config dir>/sonic-sabotage/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

impl SabotageConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |message: String| ConfigError::Write {
            path: path.display().to_string(),
            message,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| write_err(format!("Failed to create config dir: {e}")))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| write_err(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }
}
