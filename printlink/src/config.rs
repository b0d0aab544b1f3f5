//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use printlink_core::discovery::{supported_models, DISCOVER_PORT};
use printlink_core::protocol::SACP_PORT;
use printlink_core::ChecksumPolicy;
use serde::Deserialize;

use crate::device::ConnectionSettings;
use crate::discovery::{DiscoverySettings, ReceiveStrategy};
use crate::transport::http::HTTP_PORT;

/// Client configuration. File: ~/.config/printlink/config.toml or /etc/printlink/config.toml.
/// Env overrides: PRINTLINK_DISCOVERY_PORT, PRINTLINK_DISCOVERY_INTERVAL_SECS, PRINTLINK_CHUNK_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 20054).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Seconds between discovery broadcasts (default 16).
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Receive window after each broadcast for the collect strategy (default 200 ms).
    #[serde(default = "default_collect_window_ms")]
    pub collect_window_ms: u64,
    #[serde(default)]
    pub discovery_strategy: ReceiveStrategy,
    /// SACP TCP port (default 8888).
    #[serde(default = "default_sacp_port")]
    pub sacp_port: u16,
    /// HTTP API port (default 8080).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Interval between authorization polls while the touchscreen prompt is open (default 1500 ms).
    #[serde(default = "default_auth_poll_interval_ms")]
    pub auth_poll_interval_ms: u64,
    /// Give up waiting for authorization after this long; 0 waits forever (default 300).
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Fail a transfer when the device goes quiet this long; 0 waits forever (default 30).
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    #[serde(default)]
    pub checksum_policy: ChecksumPolicy,
    /// Models accepted from discovery (default: every supported machine).
    #[serde(default = "supported_models")]
    pub supported_models: Vec<String>,
    /// Client name sent in the SACP handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Host device name sent in the SACP handshake.
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

fn default_discovery_port() -> u16 {
    DISCOVER_PORT
}
fn default_discovery_interval_secs() -> u64 {
    16
}
fn default_collect_window_ms() -> u64 {
    200
}
fn default_sacp_port() -> u16 {
    SACP_PORT
}
fn default_http_port() -> u16 {
    HTTP_PORT
}
fn default_auth_poll_interval_ms() -> u64 {
    1500
}
fn default_auth_timeout_secs() -> u64 {
    300
}
fn default_chunk_timeout_secs() -> u64 {
    30
}
fn default_client_name() -> String {
    "printlink".to_string()
}
fn default_device_name() -> String {
    "Desktop".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            discovery_interval_secs: default_discovery_interval_secs(),
            collect_window_ms: default_collect_window_ms(),
            discovery_strategy: ReceiveStrategy::default(),
            sacp_port: default_sacp_port(),
            http_port: default_http_port(),
            auth_poll_interval_ms: default_auth_poll_interval_ms(),
            auth_timeout_secs: default_auth_timeout_secs(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            checksum_policy: ChecksumPolicy::default(),
            supported_models: supported_models(),
            client_name: default_client_name(),
            device_name: default_device_name(),
        }
    }
}

impl Config {
    pub fn discovery(&self) -> DiscoverySettings {
        DiscoverySettings {
            port: self.discovery_port,
            interval: Duration::from_secs(self.discovery_interval_secs.max(1)),
            collect_window: Duration::from_millis(self.collect_window_ms),
            strategy: self.discovery_strategy,
        }
    }

    pub fn connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            auth_poll_interval: Duration::from_millis(self.auth_poll_interval_ms),
            auth_timeout: nonzero_secs(self.auth_timeout_secs),
        }
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.chunk_timeout_secs)
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("PRINTLINK_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(s) = var("PRINTLINK_DISCOVERY_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
        c.discovery_interval_secs = s;
    }
    if let Some(s) = var("PRINTLINK_CHUNK_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.chunk_timeout_secs = s;
    }
}

/// Per-user config directory (also holds the token file).
pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/printlink"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = config_dir() {
        out.push(dir.join("config.toml"));
    }
    out.push(PathBuf::from("/etc/printlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.discovery_port, 20054);
        assert_eq!(c.sacp_port, 8888);
        assert_eq!(c.http_port, 8080);
        assert_eq!(c.checksum_policy, ChecksumPolicy::Lenient);
        assert_eq!(c.supported_models.len(), 5);
        assert_eq!(c.chunk_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn file_overrides() {
        let c: Config = toml::from_str(
            r#"
            discovery_interval_secs = 10
            discovery_strategy = "collect"
            checksum_policy = "strict"
            chunk_timeout_secs = 0
            supported_models = ["Snapmaker J1"]
            "#,
        )
        .unwrap();
        assert_eq!(c.discovery().interval, Duration::from_secs(10));
        assert_eq!(c.discovery().strategy, ReceiveStrategy::Collect);
        assert_eq!(c.checksum_policy, ChecksumPolicy::Strict);
        assert_eq!(c.chunk_timeout(), None);
        assert_eq!(c.supported_models, vec!["Snapmaker J1".to_string()]);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        apply_env(&mut c, |key| match key {
            "PRINTLINK_DISCOVERY_PORT" => Some("30000".into()),
            "PRINTLINK_CHUNK_TIMEOUT_SECS" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(c.discovery_port, 30000);
        assert_eq!(c.chunk_timeout_secs, 30);
    }
}
