use std::{env, path::{Path, PathBuf}, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bridge_core::{
    CommandConfig, EncoderPrefs, EncoderRegistry, Heartbeat, Listen, ServerOptions,
    SessionOptions,
};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::logger::{DEFAULT_LOG_CAPACITY, LogConfig, LogLevel};

pub const ENV_PREFIX: &str = "BOTBRIDGE_";

/// Where configuration values come from. Keys are given without the
/// `BOTBRIDGE_` prefix.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, optionally seeded from a `.env` file. Variables
/// already set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigSource {
    env_file: Option<PathBuf>,
}

impl EnvConfigSource {
    pub fn new(env_file: Option<PathBuf>) -> Self {
        match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => warn!("could not load .env from {}: {err}", path.display()),
            },
            Some(path) => warn!("no .env at {}, using the environment only", path.display()),
            None => {}
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}

/// In-memory source, mostly for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct MapConfigSource {
    map: DashMap<String, String>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) -> &Self {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// Settings for a manager process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: String,                     // unix:/path, tcp://host:port or ws://host:port
    pub name: String,                       // advertised in the handshake
    pub max_connections: Option<usize>,
    pub encoders: EncoderPrefs,
    pub secret: Option<String>,             // keys the blake3 checksums
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,         // 0 disables websocket heartbeats
    pub heartbeat_timeout_ms: u64,
    pub command_prefix: String,
    pub command_split: String,
    pub log_level: LogLevel,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
    pub log_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let heartbeat = Heartbeat::default();
        let command = CommandConfig::default();
        Self {
            listen: "ws://127.0.0.1:7700".into(),
            name: "botbridge".into(),
            max_connections: None,
            encoders: EncoderPrefs::default(),
            secret: None,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: heartbeat.interval.as_millis() as u64,
            heartbeat_timeout_ms: heartbeat.timeout.as_millis() as u64,
            command_prefix: command.prefix,
            command_split: command.split,
            log_level: LogLevel::Info,
            log_dir: None,
            log_json: false,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

fn parse<T>(source: &dyn ConfigSource, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{ENV_PREFIX}{key}={raw:?}: {e}")),
    }
}

fn list(source: &dyn ConfigSource, key: &str) -> Option<Vec<String>> {
    source.get(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl BridgeConfig {
    /// Loads `env_file` (when given) and reads `BOTBRIDGE_*` variables.
    pub fn from_env(env_file: Option<PathBuf>) -> Result<Self> {
        Self::load(&EnvConfigSource::new(env_file))
    }

    /// Defaults overridden by whatever `source` provides.
    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = source.get("LISTEN") {
            config.listen = v;
        }
        if let Some(v) = source.get("NAME") {
            config.name = v;
        }
        if let Some(v) = parse::<usize>(source, "MAX_CONNECTIONS")? {
            config.max_connections = (v > 0).then_some(v);
        }
        if let Some(v) = list(source, "ENCODE") {
            config.encoders.encode = v;
        }
        if let Some(v) = list(source, "VERIFY") {
            config.encoders.verify = v;
        }
        if let Some(v) = list(source, "COMPRESS") {
            config.encoders.compress = v;
        }
        if let Some(v) = source.get("SECRET") {
            config.secret = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = parse(source, "HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout_ms = v;
        }
        if let Some(v) = parse(source, "HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = parse(source, "HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat_timeout_ms = v;
        }
        if let Some(v) = source.get("COMMAND_PREFIX") {
            config.command_prefix = v;
        }
        if let Some(v) = source.get("COMMAND_SPLIT") {
            config.command_split = v;
        }
        if let Some(v) = parse(source, "LOG_LEVEL")? {
            config.log_level = v;
        }
        if let Some(v) = source.get("LOG_DIR") {
            config.log_dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = parse(source, "LOG_JSON")? {
            config.log_json = v;
        }
        if let Some(v) = parse(source, "LOG_CAPACITY")? {
            config.log_capacity = v;
        }
        config.listen().context("invalid listen address")?;
        Ok(config)
    }

    pub fn listen(&self) -> Result<Listen> {
        self.listen
            .parse::<Listen>()
            .with_context(|| format!("cannot listen on {:?}", self.listen))
    }

    pub fn registry(&self) -> Arc<EncoderRegistry> {
        match &self.secret {
            Some(secret) => Arc::new(EncoderRegistry::builtin(Some(secret))),
            None => EncoderRegistry::global(),
        }
    }

    pub fn heartbeat(&self) -> Option<Heartbeat> {
        (self.heartbeat_interval_ms > 0).then(|| Heartbeat {
            interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            name: self.name.clone(),
            encoders: self.encoders.clone(),
            registry: self.registry(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat: self.heartbeat(),
            ..SessionOptions::default()
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_connections: self.max_connections,
            session: self.session_options(),
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            prefix: self.command_prefix.clone(),
            split: self.command_split.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level,
            log_dir: self.log_dir.clone(),
            json: self.log_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_listen_on_local_websocket() {
        let config = BridgeConfig::load(&MapConfigSource::new()).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.listen().unwrap(), Listen::WebSocket("127.0.0.1:7700".into()));
        assert_eq!(config.command_config(), CommandConfig::default());
        assert!(config.heartbeat().is_some());
    }

    #[test]
    fn source_values_override_defaults() {
        let source = MapConfigSource::new();
        source
            .set("LISTEN", "tcp://0.0.0.0:9000")
            .set("MAX_CONNECTIONS", "4")
            .set("ENCODE", "cbor, json")
            .set("VERIFY", "")
            .set("COMPRESS", "gzip")
            .set("HEARTBEAT_INTERVAL_MS", "0")
            .set("COMMAND_PREFIX", "!")
            .set("LOG_LEVEL", "Debug");
        let config = BridgeConfig::load(&source).unwrap();

        assert_eq!(config.listen().unwrap(), Listen::Tcp("0.0.0.0:9000".into()));
        assert_eq!(config.max_connections, Some(4));
        assert_eq!(config.encoders.encode, vec!["cbor", "json"]);
        assert!(config.encoders.verify.is_empty());
        assert_eq!(config.encoders.compress, vec!["gzip"]);
        assert_eq!(config.heartbeat(), None);
        assert_eq!(config.command_config().prefix, "!");
        assert_eq!(config.log_level, LogLevel::Debug);

        let options = config.server_options();
        assert_eq!(options.max_connections, Some(4));
        assert_eq!(options.session.heartbeat, None);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let source = MapConfigSource::new();
        source.set("MAX_CONNECTIONS", "lots");
        let err = BridgeConfig::load(&source).unwrap_err().to_string();
        assert!(err.contains("BOTBRIDGE_MAX_CONNECTIONS"), "{err}");

        let source = MapConfigSource::new();
        source.set("LISTEN", "nowhere");
        assert!(BridgeConfig::load(&source).is_err());
    }

    #[test]
    fn config_round_trips_through_serde_defaults() {
        let partial: BridgeConfig = serde_json::from_str(r#"{"listen": "unix:/tmp/bb.sock"}"#).unwrap();
        assert_eq!(partial.name, "botbridge");
        assert_eq!(partial.log_capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn env_file_is_loaded() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "BOTBRIDGE_TEST_ONLY_NAME=from-file\n").unwrap();

        let source = EnvConfigSource::new(Some(env_path.clone()));
        assert_eq!(source.env_file(), Some(env_path.as_path()));
        assert_eq!(source.get("TEST_ONLY_NAME").as_deref(), Some("from-file"));
    }
}
