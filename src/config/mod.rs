use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{DevframeError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Remote-debugging discovery configuration
    #[serde(default)]
    pub devtools: DevToolsConfig,

    /// Relay WebSocket server configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Storage persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy listener binds to
    #[serde(default = "default_loopback")]
    pub bind_host: String,

    /// Address the target application listens on
    #[serde(default = "default_loopback")]
    pub upstream_host: String,

    /// Fixed listen port, 0 picks an ephemeral one
    #[serde(default)]
    pub listen_port: u16,

    /// How long `stop` waits for in-flight requests before force-closing
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Script source of the instrumentation bundle
    #[serde(default = "default_bundle_src")]
    pub bundle_src: String,

    /// Local file served by the proxy at `bundle_src`
    pub bundle_file: Option<String>,

    /// Reserved id of the toolbar mount element
    #[serde(default = "default_mount_id")]
    pub mount_id: String,

    /// Externally addressable origin of the proxy (as tunneled by the panel host)
    pub public_origin: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: default_loopback(),
            upstream_host: default_loopback(),
            listen_port: 0,
            drain_grace_ms: default_drain_grace_ms(),
            bundle_src: default_bundle_src(),
            bundle_file: None,
            mount_id: default_mount_id(),
            public_origin: None,
        }
    }
}

impl ProxyConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// `bundle_file` with `~` and env vars expanded.
    pub fn resolve_bundle_file(&self) -> Result<Option<PathBuf>> {
        self.bundle_file
            .as_deref()
            .map(|file| {
                shellexpand::full(file)
                    .map(|expanded| PathBuf::from(expanded.as_ref()))
                    .map_err(|e| DevframeError::ConfigError(e.to_string()))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevToolsConfig {
    /// Base URL of the remote-debugging server
    #[serde(default = "default_devtools_endpoint")]
    pub endpoint: String,

    /// Number of probes before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between probes
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Timeout of a single probe request
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Delay before the background discovery that follows a proxied navigation
    #[serde(default = "default_background_delay_ms")]
    pub background_delay_ms: u64,
}

impl Default for DevToolsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_devtools_endpoint(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            background_delay_ms: default_background_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Port of the relay WebSocket server
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding cookie and localStorage snapshots
    pub dir: Option<String>,
}

impl StorageConfig {
    /// Resolve the storage directory, expanding `~` and env vars.
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => {
                let expanded = shellexpand::full(dir)
                    .map_err(|e| DevframeError::ConfigError(e.to_string()))?;
                Ok(PathBuf::from(expanded.as_ref()))
            }
            None => Ok(default_storage_dir()),
        }
    }
}

fn default_loopback() -> String {
    "127.0.0.1".to_string()
}

fn default_drain_grace_ms() -> u64 {
    3000
}

fn default_bundle_src() -> String {
    "/__devframe/bundle.js".to_string()
}

fn default_mount_id() -> String {
    "devframe-toolbar-root".to_string()
}

fn default_devtools_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_background_delay_ms() -> u64 {
    2000
}

fn default_relay_port() -> u16 {
    19230
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devframe")
        .join("storage")
}

impl Config {
    /// Load configuration from all sources (file, env, defaults)
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // DEVFRAME_PROXY__DRAIN_GRACE_MS style keys; single underscores stay in field names
            .merge(Env::prefixed("DEVFRAME_").split("__"))
            .extract()
            .map_err(|e| DevframeError::ConfigError(e.to_string()))?;

        Ok(config)
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("DEVFRAME_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("devframe")
            .join("config.toml")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| DevframeError::ConfigError(e.to_string()))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read a single dotted key, as used by `devframe config get`.
    pub fn get_key(&self, key: &str) -> Result<Option<String>> {
        let value = match key {
            "proxy.bind_host" => Some(self.proxy.bind_host.clone()),
            "proxy.upstream_host" => Some(self.proxy.upstream_host.clone()),
            "proxy.listen_port" => Some(self.proxy.listen_port.to_string()),
            "proxy.drain_grace_ms" => Some(self.proxy.drain_grace_ms.to_string()),
            "proxy.bundle_src" => Some(self.proxy.bundle_src.clone()),
            "proxy.bundle_file" => self.proxy.bundle_file.clone(),
            "proxy.mount_id" => Some(self.proxy.mount_id.clone()),
            "proxy.public_origin" => self.proxy.public_origin.clone(),
            "devtools.endpoint" => Some(self.devtools.endpoint.clone()),
            "devtools.retry_attempts" => Some(self.devtools.retry_attempts.to_string()),
            "devtools.retry_delay_ms" => Some(self.devtools.retry_delay_ms.to_string()),
            "devtools.probe_timeout_ms" => Some(self.devtools.probe_timeout_ms.to_string()),
            "devtools.background_delay_ms" => {
                Some(self.devtools.background_delay_ms.to_string())
            }
            "relay.port" => Some(self.relay.port.to_string()),
            "storage.dir" => self.storage.dir.clone(),
            _ => {
                return Err(DevframeError::ConfigError(format!(
                    "Unknown config key: {}",
                    key
                )))
            }
        };
        Ok(value)
    }

    /// Set a single dotted key, as used by `devframe config set`.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| {
                DevframeError::ConfigError(format!("{} must be a number, got '{}'", key, value))
            })
        }

        match key {
            "proxy.bind_host" => self.proxy.bind_host = value.to_string(),
            "proxy.upstream_host" => self.proxy.upstream_host = value.to_string(),
            "proxy.listen_port" => self.proxy.listen_port = number(key, value)?,
            "proxy.drain_grace_ms" => self.proxy.drain_grace_ms = number(key, value)?,
            "proxy.bundle_src" => self.proxy.bundle_src = value.to_string(),
            "proxy.bundle_file" => self.proxy.bundle_file = Some(value.to_string()),
            "proxy.mount_id" => {
                if value.trim().is_empty() {
                    return Err(DevframeError::ConfigError(
                        "proxy.mount_id cannot be empty".to_string(),
                    ));
                }
                self.proxy.mount_id = value.trim().to_string()
            }
            "proxy.public_origin" => self.proxy.public_origin = Some(value.to_string()),
            "devtools.endpoint" => self.devtools.endpoint = value.to_string(),
            "devtools.retry_attempts" => {
                let attempts: u32 = number(key, value)?;
                if attempts == 0 {
                    return Err(DevframeError::ConfigError(
                        "devtools.retry_attempts must be at least 1".to_string(),
                    ));
                }
                self.devtools.retry_attempts = attempts
            }
            "devtools.retry_delay_ms" => self.devtools.retry_delay_ms = number(key, value)?,
            "devtools.probe_timeout_ms" => self.devtools.probe_timeout_ms = number(key, value)?,
            "devtools.background_delay_ms" => {
                self.devtools.background_delay_ms = number(key, value)?
            }
            "relay.port" => self.relay.port = number(key, value)?,
            "storage.dir" => self.storage.dir = Some(value.to_string()),
            _ => {
                return Err(DevframeError::ConfigError(format!(
                    "Unknown config key: {}",
                    key
                )))
            }
        }
        Ok(())
    }
}
