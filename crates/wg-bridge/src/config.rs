//! Bridge Configuration
//!
//! Process-wide settings for the bridge and the tunables handed to every
//! engine instance. Loaded once from the TOML file named by
//! `WG_BRIDGE_CONFIG`; every field has a default so an absent file or a
//! partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "WG_BRIDGE_CONFIG";

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Directory holding the per-interface control sockets
    pub uapi_dir: PathBuf,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Log tag prefix; tunnels log under `<tag>/<interface>`
    pub log_tag: String,
    /// MTU used when the host gives none and the interface query fails
    pub default_mtu: u32,
    /// Exclusive upper bound of tunnel handle values
    pub max_handles: i32,
    /// Install the SIGUSR2 stack dump
    pub stack_dump_signal: bool,
    /// Tunables passed to each engine instance
    pub engine: EngineOptions,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            uapi_dir: PathBuf::from("/var/run/wireguard"),
            log_level: "info".to_string(),
            log_tag: "WireGuard/GoBackend".to_string(),
            default_mtu: 1280,
            max_handles: i32::MAX,
            stack_dump_signal: true,
            engine: EngineOptions::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from `$WG_BRIDGE_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(576..=65535).contains(&self.default_mtu) {
            return Err(ConfigError::InvalidMtu(self.default_mtu));
        }
        if self.max_handles <= 0 {
            return Err(ConfigError::InvalidMaxHandles(self.max_handles));
        }
        Ok(())
    }

    /// Control socket path for an interface
    pub fn uapi_path(&self, interface: &str) -> PathBuf {
        self.uapi_dir.join(format!("{interface}.sock"))
    }
}

/// Engine tunables.
///
/// Queue sizes default to the memory-reduced values used on Android rather
/// than the desktop defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Keep peer endpoints fixed instead of following roaming peers
    pub roaming_disabled: bool,
    pub queue_outbound_size: usize,
    pub queue_inbound_size: usize,
    pub queue_handshake_size: usize,
    pub max_segment_size: usize,
    pub preallocated_buffers_per_pool: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            roaming_disabled: true,
            queue_outbound_size: 1024,
            queue_inbound_size: 1024,
            queue_handshake_size: 1024,
            max_segment_size: 2200,
            preallocated_buffers_per_pool: 4096,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Default MTU {0} out of range (576-65535)")]
    InvalidMtu(u32),

    #[error("max_handles must be positive, got {0}")]
    InvalidMaxHandles(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BridgeConfig::default();

        assert_eq!(config.default_mtu, 1280);
        assert_eq!(config.max_handles, i32::MAX);
        assert!(config.engine.roaming_disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            uapi_dir = "/data/local/tmp/wg"
            max_handles = 8

            [engine]
            queue_outbound_size = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.uapi_dir, PathBuf::from("/data/local/tmp/wg"));
        assert_eq!(config.max_handles, 8);
        assert_eq!(config.engine.queue_outbound_size, 256);
        assert_eq!(config.engine.queue_inbound_size, 1024);
        assert_eq!(config.log_tag, "WireGuard/GoBackend");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            BridgeConfig::from_toml_str("default_mtu = 100"),
            Err(ConfigError::InvalidMtu(100))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("max_handles = 0"),
            Err(ConfigError::InvalidMaxHandles(0))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("max_handles = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/wg-bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_uapi_path() {
        let config = BridgeConfig::default();
        assert_eq!(
            config.uapi_path("tun0"),
            PathBuf::from("/var/run/wireguard/tun0.sock")
        );
    }
}
