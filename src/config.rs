//! Bridge configuration
//!
//! Loaded in three layers, later ones winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`BRIDGE_CONFIG` or the first CLI argument)
//! 3. environment variables
//!
//! ## Environment
//! - `BRIDGE_BROKER_HOST`, `BRIDGE_BROKER_PORT`, `BRIDGE_KEEP_ALIVE_SECS`,
//!   `BRIDGE_CLIENT_ID`: MQTT session
//! - `BRIDGE_TOPIC_PATTERN`: subscription filter (default `sensores/#`)
//! - `BRIDGE_LOG_PATH`, `BRIDGE_FSYNC`: durable log
//! - `BRIDGE_STORE_ENDPOINT`, `BRIDGE_GATEWAY_URL`: IPFS API and gateway
//! - `BRIDGE_UPLOAD_INTERVAL_SECS`, `BRIDGE_UPLOAD_TIMEOUT_SECS`: uploader
//! - `BRIDGE_LOG_FORMAT`: `pretty` or `json`

use crate::ingress::{validate_filter, BackoffConfig, MqttTransportConfig};
use crate::ingress::mqtt::MIN_KEEP_ALIVE;
use crate::log::{FsyncPolicy, LogConfig};
use crate::uploader::UploaderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "BRIDGE_CONFIG";

const DEFAULT_BROKER_HOST: &str = "localhost";
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_CLIENT_ID: &str = "telemetry-bridge";
const DEFAULT_TOPIC_PATTERN: &str = "sensores/#";
const DEFAULT_LOG_PATH: &str = "mqtt_logs.txt";
const DEFAULT_STORE_ENDPOINT: &str = "http://127.0.0.1:5001/api/v0";
const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080";
const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 30;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;
const DEFAULT_GROUP_COMMIT_MAX_ENTRIES: usize = 64;

/// Tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}' (expected pretty or json)", other)),
        }
    }
}

/// Error type for configuration loading. Only raised at startup.
#[derive(Debug)]
pub enum ConfigError {
    Read { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, message: String },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "cannot parse config {}: {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub keep_alive_secs: u64,
    pub client_id: String,
    pub topic_pattern: String,
    pub log_path: PathBuf,
    /// IPFS HTTP API base, e.g. `http://127.0.0.1:5001/api/v0`
    pub store_endpoint: String,
    pub gateway_url: String,
    pub upload_interval_seconds: u64,
    pub upload_timeout_seconds: u64,
    pub fsync: FsyncPolicy,
    pub log_format: LogFormat,
    pub group_commit_max_entries: usize,
    pub backoff: BackoffConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            topic_pattern: DEFAULT_TOPIC_PATTERN.to_string(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            store_endpoint: DEFAULT_STORE_ENDPOINT.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            upload_interval_seconds: DEFAULT_UPLOAD_INTERVAL_SECS,
            upload_timeout_seconds: DEFAULT_UPLOAD_TIMEOUT_SECS,
            fsync: FsyncPolicy::Always,
            log_format: LogFormat::Pretty,
            group_commit_max_entries: DEFAULT_GROUP_COMMIT_MAX_ENTRIES,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Defaults, then `path` (if any), then the process environment; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Apply `BRIDGE_*` overrides. `lookup` stands in for `std::env::var`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BRIDGE_BROKER_HOST") {
            self.broker_host = v;
        }
        if let Some(v) = lookup("BRIDGE_BROKER_PORT") {
            self.broker_port = parse_env("BRIDGE_BROKER_PORT", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_KEEP_ALIVE_SECS") {
            self.keep_alive_secs = parse_env("BRIDGE_KEEP_ALIVE_SECS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = lookup("BRIDGE_TOPIC_PATTERN") {
            self.topic_pattern = v;
        }
        if let Some(v) = lookup("BRIDGE_LOG_PATH") {
            self.log_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BRIDGE_STORE_ENDPOINT") {
            self.store_endpoint = v;
        }
        if let Some(v) = lookup("BRIDGE_GATEWAY_URL") {
            self.gateway_url = v;
        }
        if let Some(v) = lookup("BRIDGE_UPLOAD_INTERVAL_SECS") {
            self.upload_interval_seconds = parse_env("BRIDGE_UPLOAD_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_UPLOAD_TIMEOUT_SECS") {
            self.upload_timeout_seconds = parse_env("BRIDGE_UPLOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("BRIDGE_FSYNC") {
            self.fsync = v
                .parse()
                .map_err(|e: String| ConfigError::Invalid(format!("BRIDGE_FSYNC: {}", e)))?;
        }
        if let Some(v) = lookup("BRIDGE_LOG_FORMAT") {
            self.log_format = v
                .parse()
                .map_err(|e: String| ConfigError::Invalid(format!("BRIDGE_LOG_FORMAT: {}", e)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_host is empty".to_string()));
        }
        if self.broker_port == 0 {
            return Err(ConfigError::Invalid("broker_port must be non-zero".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::Invalid("client_id is empty".to_string()));
        }
        if Duration::from_secs(self.keep_alive_secs) < MIN_KEEP_ALIVE {
            return Err(ConfigError::Invalid(format!(
                "keep_alive_secs must be at least {}",
                MIN_KEEP_ALIVE.as_secs()
            )));
        }
        validate_filter(&self.topic_pattern).map_err(|e| {
            ConfigError::Invalid(format!("topic_pattern '{}': {}", self.topic_pattern, e))
        })?;
        if self.log_path.file_name().is_none() {
            return Err(ConfigError::Invalid(format!(
                "log_path '{}' does not name a file",
                self.log_path.display()
            )));
        }
        for (name, url) in [
            ("store_endpoint", &self.store_endpoint),
            ("gateway_url", &self.gateway_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must start with http:// or https://",
                    name, url
                )));
            }
        }
        if self.upload_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "upload_interval_seconds must be non-zero".to_string(),
            ));
        }
        if self.upload_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "upload_timeout_seconds must be non-zero".to_string(),
            ));
        }
        if self.group_commit_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "group_commit_max_entries must be non-zero".to_string(),
            ));
        }
        if self.backoff.initial_ms == 0 || self.backoff.max_ms < self.backoff.initial_ms {
            return Err(ConfigError::Invalid(
                "backoff needs 0 < initial_ms <= max_ms".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            path: self.log_path.clone(),
            fsync_policy: self.fsync,
            group_commit_max_entries: self.group_commit_max_entries,
            ..LogConfig::default()
        }
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            interval: Duration::from_secs(self.upload_interval_seconds),
            timeout: Duration::from_secs(self.upload_timeout_seconds),
            object_name: self.log_config().file_name(),
        }
    }

    pub fn mqtt_config(&self) -> MqttTransportConfig {
        MqttTransportConfig {
            host: self.broker_host.clone(),
            port: self.broker_port,
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid(format!("{}='{}': {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.topic_pattern, "sensores/#");
        assert_eq!(config.upload_interval_seconds, 30);
        assert_eq!(config.fsync, FsyncPolicy::Always);
        assert_eq!(config.uploader_config().object_name, "mqtt_logs.txt");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            broker_host = "broker.internal"
            topic_pattern = "sensors/#"
            fsync = "everysec"

            [backoff]
            initial_ms = 100
            max_ms = 1000
            multiplier = 3.0
            jitter_ratio = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.broker_host, "broker.internal");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.topic_pattern, "sensors/#");
        assert_eq!(config.fsync, FsyncPolicy::EverySecond);
        assert_eq!(config.backoff.initial_ms, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(BridgeConfig::from_toml_str("brokr_host = \"typo\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = BridgeConfig::from_toml_str("broker_port = 1884").unwrap();
        config
            .apply_env_from(env(&[
                ("BRIDGE_BROKER_PORT", "8883"),
                ("BRIDGE_UPLOAD_INTERVAL_SECS", "5"),
                ("BRIDGE_FSYNC", "no"),
                ("BRIDGE_LOG_FORMAT", "json"),
                ("BRIDGE_LOG_PATH", "/var/lib/bridge/log.txt"),
            ]))
            .unwrap();
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.uploader_config().interval, Duration::from_secs(5));
        assert_eq!(config.fsync, FsyncPolicy::No);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_config().file_name(), "log.txt");
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env_from(env(&[("BRIDGE_BROKER_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("BRIDGE_BROKER_PORT"));

        let err = config
            .apply_env_from(env(&[("BRIDGE_FSYNC", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("BRIDGE_FSYNC"));
    }

    #[test]
    fn test_validation_rejects() {
        let cases: Vec<(&str, Box<dyn Fn(&mut BridgeConfig)>)> = vec![
            ("empty host", Box::new(|c| c.broker_host = " ".to_string())),
            ("port 0", Box::new(|c| c.broker_port = 0)),
            ("bad filter", Box::new(|c| c.topic_pattern = "sensors/#/x".to_string())),
            ("empty filter", Box::new(|c| c.topic_pattern = String::new())),
            ("zero interval", Box::new(|c| c.upload_interval_seconds = 0)),
            ("zero timeout", Box::new(|c| c.upload_timeout_seconds = 0)),
            ("no scheme", Box::new(|c| c.store_endpoint = "127.0.0.1:5001".to_string())),
            ("gateway scheme", Box::new(|c| c.gateway_url = "ftp://gw".to_string())),
            ("short keep-alive", Box::new(|c| c.keep_alive_secs = 1)),
        ];

        for (name, mutate) in cases {
            let mut config = BridgeConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "upload_interval_seconds = 10").unwrap();
        writeln!(file, "gateway_url = \"https://ipfs.io\"").unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.upload_interval_seconds, 10);
        assert_eq!(config.gateway_url, "https://ipfs.io");
    }

    #[test]
    fn test_load_missing_file() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_mqtt_config() {
        let config = BridgeConfig {
            broker_host: "10.0.0.2".to_string(),
            keep_alive_secs: 15,
            ..Default::default()
        };
        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.host, "10.0.0.2");
        assert_eq!(mqtt.keep_alive, Duration::from_secs(15));
        assert_eq!(mqtt.client_id, "telemetry-bridge");
    }
}
