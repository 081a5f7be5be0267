use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

/// `client.json` is expected to hold a handful of scalars.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_RELAY_PORT: u16 = 8080;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub relay_host: String,
    pub relay_port: u16,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_owned(),
            relay_port: DEFAULT_RELAY_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn relay_url(&self) -> String {
        format!("ws://{}:{}", self.relay_host, self.relay_port)
    }

    fn apply(mut self, file: FileConfig) -> Self {
        if let Some(host) = file.relay_host.filter(|host| !host.trim().is_empty()) {
            self.relay_host = host.trim().to_owned();
        }
        if let Some(port) = file.relay_port {
            self.relay_port = port;
        }
        if let Some(ms) = file.connect_timeout_ms {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.keep_alive_interval_ms {
            self.keep_alive_interval = Duration::from_millis(ms);
        }
        self
    }
}

/// On-disk shape. Every key is optional; missing keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    #[serde(default)]
    relay_host: Option<String>,
    #[serde(default)]
    relay_port: Option<u16>,
    #[serde(default)]
    connect_timeout_ms: Option<u64>,
    #[serde(default)]
    keep_alive_interval_ms: Option<u64>,
}

#[derive(Debug)]
pub enum ConfigLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            ConfigLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            ConfigLoadError::Read(e) => write!(f, "read failed: {e}"),
            ConfigLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigLoadError::Metadata(e) => Some(e),
            ConfigLoadError::Read(e) => Some(e),
            ConfigLoadError::Parse(e) => Some(e),
            ConfigLoadError::TooLarge { .. } => None,
        }
    }
}

/// `WAVELENGTH_CONFIG` wins; otherwise `client.json` under the data directory.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("WAVELENGTH_CONFIG") {
        return PathBuf::from(path);
    }
    data_dir().join("client.json")
}

pub fn data_dir() -> PathBuf {
    let base = std::env::var_os("WAVELENGTH_DATA_DIR")
        .or_else(|| std::env::var_os("LOCALAPPDATA"))
        .or_else(|| std::env::var_os("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("wavelength")
}

pub fn parse_config_json(data: &str) -> Result<ClientConfig, serde_json::Error> {
    let file = serde_json::from_str::<FileConfig>(data)?;
    Ok(ClientConfig::default().apply(file))
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigLoadError> {
    let meta = fs::metadata(path).map_err(ConfigLoadError::Metadata)?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigLoadError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(ConfigLoadError::Read)?;
    parse_config_json(&data).map_err(ConfigLoadError::Parse)
}

/// Missing files are normal on first run and are not logged.
pub fn load_or_default(path: &Path) -> ClientConfig {
    match load_config_from_path(path) {
        Ok(config) => config,
        Err(ConfigLoadError::Metadata(err)) if err.kind() == io::ErrorKind::NotFound => {
            ClientConfig::default()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring client config: {err}");
            ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        assert_eq!(parse_config_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_present_keys() {
        let config =
            parse_config_json(r#"{"relayHost":"relay.example","keepAliveIntervalMs":1500}"#).unwrap();
        assert_eq!(config.relay_host, "relay.example");
        assert_eq!(config.relay_port, DEFAULT_RELAY_PORT);
        assert_eq!(config.keep_alive_interval, Duration::from_millis(1500));
        assert_eq!(config.relay_url(), "ws://relay.example:8080");
    }

    #[test]
    fn blank_host_keeps_default() {
        let config = parse_config_json(r#"{"relayHost":"  "}"#).unwrap();
        assert_eq!(config.relay_host, DEFAULT_RELAY_HOST);
    }
}
