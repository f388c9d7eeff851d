use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Link and relay protocol constants
pub mod protocol {
    /// Link protocol versions offered in VERSIONS
    pub const LINK_VERSIONS: [u16; 2] = [4, 5];

    /// Size of a fixed-length cell with a 4-byte circuit id
    pub const CELL_LEN: usize = 514;

    /// Payload bytes in a fixed-length cell
    pub const CELL_PAYLOAD_LEN: usize = 509;

    /// Relay cell header: command, recognized, stream id, digest, length
    pub const RELAY_HEADER_LEN: usize = 11;

    /// Maximum data bytes in one relay cell
    pub const RELAY_DATA_LEN: usize = CELL_PAYLOAD_LEN - RELAY_HEADER_LEN;

    /// Connection timeout
    pub const CONNECTION_TIMEOUT_SECS: u64 = 20;

    /// Per-read/write timeout on an established link
    pub const IO_TIMEOUT_SECS: u64 = 60;
}

/// Directory protocol constants
pub mod directory {
    /// Consensus download paths, tried in this order
    pub const CONSENSUS_PATHS: [&str; 4] = [
        "/tor/status-vote/current/consensus",
        "/tor/status-vote/current/consensus.z",
        "/tor/status-vote/current/ns",
        "/tor/status-vote/current/consensus-microdesc",
    ];

    /// Server descriptor path prefix, followed by the hex fingerprint(s)
    pub const SERVER_DESCRIPTOR_PATH: &str = "/tor/server/fp/";

    /// Onion service descriptor path prefix, followed by the base64 blinded key
    pub const HS_DESCRIPTOR_PATH: &str = "/tor/hs/3/";

    /// Directory ports accepted when fetching from regular relays
    pub const DEFAULT_ALLOWED_DIR_PORTS: [u16; 2] = [80, 443];

    /// Attempts per directory path before moving on
    pub const DEFAULT_MAX_TRY_COUNT: usize = 3;

    /// Fingerprints per batched descriptor request
    pub const DESCRIPTOR_BATCH_SIZE: usize = 96;

    /// Upper bound on a directory response body (16 MB)
    pub const MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;
}

/// Circuit construction constants
pub mod circuit {
    /// Default circuit length (number of hops)
    pub const DEFAULT_HOP_COUNT: usize = 3;

    /// Maximum circuit length
    pub const MAX_HOP_COUNT: usize = 8;

    /// OR ports accepted for the first hop of a default circuit
    pub const GUARD_OR_PORTS: [u16; 1] = [443];

    /// Attempts at building a full circuit before giving up
    pub const BUILD_ATTEMPTS: usize = 5;

    /// DATA cells received per circuit-level SENDME
    pub const CIRCUIT_SENDME_INCREMENT: u32 = 100;

    /// DATA cells received per stream-level SENDME
    pub const STREAM_SENDME_INCREMENT: u32 = 50;
}

/// Onion service (v3) constants
pub mod onion {
    /// Time period length in minutes
    pub const TIME_PERIOD_LENGTH: u64 = 1440;

    /// Offset of the time period rotation from midnight, in minutes
    pub const TIME_PERIOD_ROTATION_OFFSET: u64 = 720;

    /// Descriptor replicas stored on the ring
    pub const HSDIR_N_REPLICAS: u8 = 2;

    /// HSDirs consulted per replica
    pub const HSDIR_SPREAD_FETCH: usize = 3;

    /// Introduction points attempted before failing
    pub const MAX_INTRO_ATTEMPTS: usize = 3;
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Consensus cache file (none = always download)
    pub cache_path: Option<PathBuf>,

    /// Ignore the cache and download a fresh consensus
    pub force_download: bool,

    /// Directory ports accepted when picking a relay for directory fetches
    pub allowed_dir_ports: BTreeSet<u16>,

    /// Attempts per directory path
    pub max_try_count: usize,

    /// Hops in a default circuit
    pub hop_count: usize,

    /// TCP/TLS connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Read/write timeout in seconds
    pub io_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            force_download: false,
            allowed_dir_ports: directory::DEFAULT_ALLOWED_DIR_PORTS.into_iter().collect(),
            max_try_count: directory::DEFAULT_MAX_TRY_COUNT,
            hop_count: circuit::DEFAULT_HOP_COUNT,
            connect_timeout_secs: protocol::CONNECTION_TIMEOUT_SECS,
            io_timeout_secs: protocol::IO_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    pub fn with_hop_count(mut self, hops: usize) -> Self {
        self.hop_count = hops.clamp(1, circuit::MAX_HOP_COUNT);
        self
    }

    pub fn with_max_try_count(mut self, count: usize) -> Self {
        self.max_try_count = count.max(1);
        self
    }

    pub fn with_allowed_dir_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.allowed_dir_ports = ports.into_iter().collect();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.hop_count, circuit::DEFAULT_HOP_COUNT);
        assert!(config.allowed_dir_ports.contains(&80));
        assert!(config.allowed_dir_ports.contains(&443));
        assert!(config.cache_path.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .with_cache_path("/tmp/consensus")
            .with_force_download(true)
            .with_hop_count(42)
            .with_max_try_count(0);

        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/consensus")));
        assert!(config.force_download);
        assert_eq!(config.hop_count, circuit::MAX_HOP_COUNT);
        assert_eq!(config.max_try_count, 1);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minitor.toml");
        let config = ClientConfig::new()
            .with_hop_count(2)
            .with_allowed_dir_ports([80]);

        config.to_file(&path).unwrap();
        assert_eq!(ClientConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig = toml::from_str("hop_count = 1").unwrap();
        assert_eq!(config.hop_count, 1);
        assert_eq!(config.max_try_count, directory::DEFAULT_MAX_TRY_COUNT);
    }
}
