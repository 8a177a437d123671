//! Agent settings
//!
//! TOML-backed configuration with defaults matching the shipped agent.
//! Only the keys that influence the data-plane core live here; API, tray
//! and updater settings belong to their own components.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Default UDP port for the peer transport.
pub const DEFAULT_UDP_PORT: u16 = 45820;

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 1280;

const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// A network the agent is (or can be) a member of.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub joined: bool,
    /// Overlay address in CIDR form, assigned by the controller on join.
    #[serde(default)]
    pub address: String,
}

/// Forwarder knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    pub buffer_packets: usize,
    pub max_frame_bytes: usize,
    pub shutdown_timeout_secs: u64,
    pub max_dial_failures: u32,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            buffer_packets: 256,
            max_frame_bytes: 65535,
            shutdown_timeout_secs: 3,
            max_dial_failures: 20,
        }
    }
}

impl CoreSettings {
    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub trusted_peer_certs: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkRef>,
    #[serde(default)]
    pub core: CoreSettings,
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("secrets")
}

fn default_stun_servers() -> Vec<String> {
    vec![DEFAULT_STUN_SERVER.to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            mtu: DEFAULT_MTU,
            log_level: default_log_level(),
            secrets_dir: default_secrets_dir(),
            stun_servers: default_stun_servers(),
            peers: Vec::new(),
            trusted_peer_certs: Vec::new(),
            networks: Vec::new(),
            core: CoreSettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration from a TOML file.
    pub async fn load(path: &Path) -> CoreResult<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        toml::from_str(&contents).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
    }

    /// Load configuration, writing defaults when the file is missing.
    pub async fn load_or_create(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let settings = Self::default();
            settings.save(path).await?;
            Ok(settings)
        }
    }

    /// Save configuration to a TOML file.
    pub async fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate values that would otherwise fail deep inside the core.
    pub fn validate(&self) -> CoreResult<()> {
        if self.mtu < 576 || self.mtu > 1500 {
            return Err(CoreError::Config(format!(
                "mtu {} out of range 576..=1500",
                self.mtu
            )));
        }
        if self.core.buffer_packets == 0 {
            return Err(CoreError::Config("buffer_packets must be positive".into()));
        }
        if self.core.max_frame_bytes == 0 || self.core.max_frame_bytes > 65535 {
            return Err(CoreError::Config(format!(
                "max_frame_bytes {} out of range 1..=65535",
                self.core.max_frame_bytes
            )));
        }
        if self.core.max_dial_failures == 0 {
            return Err(CoreError::Config("max_dial_failures must be positive".into()));
        }
        for peer in &self.peers {
            if !peer.is_empty() && !peer.contains(':') {
                return Err(CoreError::Config(format!(
                    "peer '{peer}' is not host:port"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.udp_port, 45820);
        assert_eq!(settings.mtu, 1280);
        assert_eq!(settings.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(settings.core.buffer_packets, 256);
        assert_eq!(settings.core.shutdown_timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut settings = Settings::default();
        settings.peers = vec!["203.0.113.4:45820".to_string()];
        settings.networks = vec![NetworkRef {
            id: "net-1".into(),
            name: "lan party".into(),
            joined: true,
            address: "100.64.0.7/10".into(),
        }];
        settings.save(&path).await.unwrap();

        let loaded = Settings::load(&path).await.unwrap();
        assert_eq!(loaded.peers, settings.peers);
        assert_eq!(loaded.networks[0].address, "100.64.0.7/10");
        assert!(loaded.networks[0].joined);
    }

    #[tokio::test]
    async fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let created = Settings::load_or_create(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(created.udp_port, DEFAULT_UDP_PORT);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.mtu = 100;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.core.max_frame_bytes = 70000;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.peers = vec!["noport".into()];
        assert!(settings.validate().is_err());
    }
}
