//! Load config from file and environment.

use std::path::{Path, PathBuf};

use bluechat_core::{Capabilities, FrameFormat, PeerDevice, DEFAULT_READ_BUFFER_SIZE, SERVICE_UUID};
use serde::Deserialize;
use uuid::Uuid;

/// Daemon configuration. File: ~/.config/bluechat/config.toml or /etc/bluechat/config.toml.
/// Env overrides: BLUECHAT_DEVICE_NAME, BLUECHAT_TRANSPORT_PORT, BLUECHAT_DISCOVERY_PORT, BLUECHAT_SERVICE_UUID.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name sent as sender name and in discovery announces.
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Stream transport TCP port (default 47100). 0 picks a free port.
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 47101).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_discovery_group")]
    pub discovery_group: String,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default)]
    pub framing: FrameFormat,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// How long one `start_discovery` keeps probing.
    #[serde(default = "default_scan_window_secs")]
    pub scan_window_secs: u64,
    /// Answer other devices' scans.
    #[serde(default = "default_true")]
    pub discoverable: bool,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
    /// Bonded-device registry.
    #[serde(default)]
    pub paired: Vec<PairedPeer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityConfig {
    #[serde(default = "default_true")]
    pub scan: bool,
    #[serde(default = "default_true")]
    pub connect: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairedPeer {
    #[serde(default)]
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid service uuid {0:?}: {1}")]
    InvalidServiceId(String, uuid::Error),
    #[error("invalid discovery group {0:?}")]
    InvalidDiscoveryGroup(String),
    #[error("read buffer size must be non-zero")]
    ZeroReadBuffer,
    #[error("read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("parse {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_transport_port() -> u16 {
    47100
}
fn default_discovery_port() -> u16 {
    47101
}
fn default_discovery_group() -> String {
    "239.255.60.61".to_string()
}
fn default_service_uuid() -> String {
    SERVICE_UUID.to_string()
}
fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}
fn default_scan_window_secs() -> u64 {
    12
}
fn default_true() -> bool {
    true
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            scan: true,
            connect: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: None,
            bind_host: default_bind_host(),
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            discovery_group: default_discovery_group(),
            service_uuid: default_service_uuid(),
            framing: FrameFormat::default(),
            read_buffer_size: default_read_buffer_size(),
            scan_window_secs: default_scan_window_secs(),
            discoverable: true,
            capabilities: CapabilityConfig::default(),
            paired: Vec::new(),
        }
    }
}

impl Config {
    /// Parsed service identifier. A malformed value aborts session setup.
    pub fn service_id(&self) -> Result<Uuid, ConfigError> {
        Uuid::parse_str(&self.service_uuid)
            .map_err(|e| ConfigError::InvalidServiceId(self.service_uuid.clone(), e))
    }

    pub fn discovery_group(&self) -> Result<std::net::Ipv4Addr, ConfigError> {
        self.discovery_group
            .parse()
            .map_err(|_| ConfigError::InvalidDiscoveryGroup(self.discovery_group.clone()))
    }

    /// Check every derived value up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service_id()?;
        self.discovery_group()?;
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ZeroReadBuffer);
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(self.capabilities.scan, self.capabilities.connect)
    }

    pub fn paired_devices(&self) -> Vec<PeerDevice> {
        self.paired
            .iter()
            .map(|p| PeerDevice::new(p.name.clone(), p.address.clone()))
            .collect()
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Load from an explicit path (errors are reported, not swallowed), then env vars.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let mut c: Config = toml::from_str(&s).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("BLUECHAT_DEVICE_NAME") {
        if !s.is_empty() {
            c.device_name = Some(s);
        }
    }
    if let Some(s) = var("BLUECHAT_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Some(s) = var("BLUECHAT_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = var("BLUECHAT_SERVICE_UUID") {
        c.service_uuid = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bluechat/config.toml"));
    }
    out.push(PathBuf::from("/etc/bluechat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.transport_port, 47100);
        assert_eq!(c.read_buffer_size, 1024);
        assert_eq!(c.framing, FrameFormat::Delimited);
        assert_eq!(c.service_id().unwrap(), SERVICE_UUID);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parses_file_with_paired_peers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
device_name = "laptop"
framing = "length-prefixed"

[capabilities]
scan = false

[[paired]]
name = "phone"
address = "192.168.1.20:47100"
"#
        )
        .unwrap();
        let c = load_from(file.path()).unwrap();
        assert_eq!(c.device_name.as_deref(), Some("laptop"));
        assert_eq!(c.framing, FrameFormat::LengthPrefixed);
        assert!(!c.capabilities.scan);
        assert!(c.capabilities.connect);
        let paired = c.paired_devices();
        assert_eq!(paired.len(), 1);
        assert_eq!(paired[0].address, "192.168.1.20:47100");
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "proxy_port = 3128").unwrap();
        assert!(matches!(
            load_from(file.path()),
            Err(ConfigError::Parse(..))
        ));
    }

    #[test]
    fn malformed_service_uuid_is_config_error() {
        let c = Config {
            service_uuid: "not-a-uuid".into(),
            ..Config::default()
        };
        assert!(matches!(c.validate(), Err(ConfigError::InvalidServiceId(..))));
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "BLUECHAT_TRANSPORT_PORT" => Some("5000".into()),
            "BLUECHAT_DISCOVERY_PORT" => Some("junk".into()),
            "BLUECHAT_DEVICE_NAME" => Some("desk".into()),
            _ => None,
        });
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.discovery_port, 47101);
        assert_eq!(c.device_name.as_deref(), Some("desk"));
    }
}
