//! Configuration
//!
//! Loaded from `config.toml` in the platform config directory, then
//! overridden from the environment:
//!
//! | Variable             | Field                     |
//! |----------------------|---------------------------|
//! | `WALKIE_UDP_PORT`    | `network.udp_port`        |
//! | `WALKIE_STREAM_ADDR` | `stream.listen_address`   |
//! | `WALKIE_CHUNK_SIZE`  | `audio.chunk_size`        |
//! | `WALKIE_NAME`        | `stream.local_name`       |

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capability::Permission;
use crate::constants::*;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub capabilities: CapabilityConfig,
}

/// Datagram (network) transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind the shared control/audio socket on
    pub bind_address: String,
    pub udp_port: u16,
    /// Where discovery probes are sent
    pub probe_targets: Vec<String>,
    pub probe_interval_ms: u64,
    /// Blocking-call timeout; bounds how quickly loops observe cancellation
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Audio datagrams buffered per link before new ones are dropped
    pub inbound_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            probe_targets: vec![format!("255.255.255.255:{}", DEFAULT_UDP_PORT)],
            probe_interval_ms: 2000,
            poll_interval_ms: 100,
            connect_timeout_ms: 5000,
            inbound_queue: 64,
        }
    }
}

impl NetworkConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// A peer the stream transport reports on every scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub name: String,
    pub address: String,
}

/// Stream (Bluetooth-style) transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Display name announced to peers on both transports
    pub local_name: String,
    pub listen_address: String,
    /// How long the local device stays discoverable after a scan starts
    pub advertise_secs: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Desktop stand-in for the platform's bonded-device list
    pub known_peers: Vec<KnownPeer>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            local_name: "walkie".to_string(),
            listen_address: format!("0.0.0.0:{}", DEFAULT_STREAM_PORT),
            advertise_secs: DISCOVERABLE_DURATION_SECS,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 3000,
            poll_interval_ms: 100,
            known_peers: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn advertise_duration(&self) -> Duration {
        Duration::from_secs(self.advertise_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Audio pipeline settings. Audio is carried as opaque PCM bytes; the
/// format fields only describe what capture produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Bytes per captured chunk (platform minimum buffer size)
    pub chunk_size: usize,
    /// Chunks buffered between capture and send
    pub queue_capacity: usize,
    pub push_to_talk: bool,
    /// Consecutive send failures tolerated before the session is torn down
    pub max_send_failures: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bits_per_sample: 16,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: CHUNK_QUEUE_CAPACITY,
            push_to_talk: false,
            max_send_failures: DEFAULT_MAX_SEND_FAILURES,
        }
    }
}

/// Session state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a switchover searches the other transport for the peer
    pub switch_discovery_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            switch_discovery_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

impl SessionConfig {
    pub fn switch_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_discovery_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Initial capability set handed to the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub granted: Vec<Permission>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            granted: Permission::ALL.to_vec(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/config.toml`, if the platform has a config directory
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "walkie-link", "walkie")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Defaults, then the config file if present, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Some(port) = env_parse::<u16>("WALKIE_UDP_PORT") {
            self.network.udp_port = port;
        }
        if let Ok(addr) = std::env::var("WALKIE_STREAM_ADDR") {
            self.stream.listen_address = addr;
        }
        if let Some(size) = env_parse::<usize>("WALKIE_CHUNK_SIZE") {
            self.audio.chunk_size = size;
        }
        if let Ok(name) = std::env::var("WALKIE_NAME") {
            self.stream.local_name = name;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.udp_port == 0 {
            return Err(ConfigError::Invalid("network.udp_port must be non-zero".into()));
        }
        if self.network.poll_interval_ms == 0 || self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll intervals must be non-zero".into()));
        }
        if self.network.connect_timeout_ms == 0 || self.stream.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect timeouts must be non-zero".into()));
        }
        if self.audio.chunk_size == 0 || self.audio.chunk_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "audio.chunk_size must be within 1..={}",
                MAX_DATAGRAM_SIZE
            )));
        }
        if self.audio.queue_capacity == 0 {
            return Err(ConfigError::Invalid("audio.queue_capacity must be non-zero".into()));
        }
        if self.audio.max_send_failures == 0 {
            return Err(ConfigError::Invalid("audio.max_send_failures must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={}", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.udp_port, 8888);
        assert_eq!(config.stream.advertise_secs, 300);
        assert_eq!(config.capabilities.granted.len(), Permission::ALL.len());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [audio]
            chunk_size = 320
            push_to_talk = true

            [[stream.known_peers]]
            name = "Kitchen"
            address = "192.168.1.20:8889"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.chunk_size, 320);
        assert!(config.audio.push_to_talk);
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.stream.known_peers.len(), 1);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_granted_permissions_parse() {
        let config = AppConfig::from_toml_str(
            r#"
            [capabilities]
            granted = ["record_audio", "bluetooth_connect"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.capabilities.granted,
            vec![Permission::RecordAudio, Permission::BluetoothConnect]
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_toml_str("[audio]\nchunk_size = 0").is_err());
        assert!(AppConfig::from_toml_str("[network]\nudp_port = 0").is_err());
        assert!(AppConfig::from_toml_str("[audio]\nchunk_size = \"big\"").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(AppConfig::from_toml_str(&text).unwrap(), config);
    }
}
