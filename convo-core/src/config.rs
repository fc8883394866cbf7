//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::monitor::EvictionPolicy;
use crate::transport::CancelPolicy;
use crate::wire::{FRAME_OVERHEAD, MAX_FRAME_LEN};

/// Messaging configuration. File: `$CONVO_CONFIG`, ~/.config/convo/config.toml or
/// /etc/convo/config.toml. Env overrides: CONVO_BROKER_URLS, CONVO_MAX_MESSAGE_SIZE,
/// CONVO_RECEIVE_TIMEOUT_SECS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Broker endpoints. `local` is the in-process broker; anything else is `host:port`.
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,
    /// How long node startup waits for each connection (default 10).
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_stop_consume_attempts")]
    pub stop_consume_attempts: u32,
    #[serde(default = "default_stop_consume_interval_ms")]
    pub stop_consume_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagingConfig {
    /// Largest payload a channel will publish (default 16 MiB).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Exchange principals listen on when no other is given.
    #[serde(default = "default_sys_name")]
    pub sys_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Default wait for a reply in request/response helpers (default 30).
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
    /// Bounded join on the listener task at close (default 2000).
    #[serde(default = "default_listener_join_timeout_ms")]
    pub listener_join_timeout_ms: u64,
    /// Wait for a peer role address before a send fails (default 30).
    #[serde(default = "default_role_resolve_timeout_secs")]
    pub role_resolve_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Check ACCEPT control bits as an `accept` transition.
    #[serde(default = "default_true")]
    pub check_accept: bool,
    /// Monitored role -> protocol spec file.
    #[serde(default)]
    pub roles: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_urls() -> Vec<String> {
    vec!["local".to_string()]
}
fn default_ready_timeout_secs() -> u64 {
    10
}
fn default_stop_consume_attempts() -> u32 {
    10
}
fn default_stop_consume_interval_ms() -> u64 {
    50
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}
fn default_sys_name() -> String {
    "convo".to_string()
}
fn default_receive_timeout_secs() -> u64 {
    30
}
fn default_listener_join_timeout_ms() -> u64 {
    2000
}
fn default_role_resolve_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    4
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            urls: default_urls(),
            ready_timeout_secs: default_ready_timeout_secs(),
            stop_consume_attempts: default_stop_consume_attempts(),
            stop_consume_interval_ms: default_stop_consume_interval_ms(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            sys_name: default_sys_name(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            receive_timeout_secs: default_receive_timeout_secs(),
            listener_join_timeout_ms: default_listener_join_timeout_ms(),
            role_resolve_timeout_secs: default_role_resolve_timeout_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            eviction: EvictionPolicy::default(),
            check_accept: true,
            roles: BTreeMap::new(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl BrokerConfig {
    pub fn cancel_policy(&self) -> CancelPolicy {
        CancelPolicy {
            attempts: self.stop_consume_attempts,
            interval: Duration::from_millis(self.stop_consume_interval_ms),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl EndpointConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn listener_join_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_join_timeout_ms)
    }

    pub fn role_resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.role_resolve_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let c: Config = toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source,
        })?;
        c.validate()?;
        Ok(c)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let c: Config = toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.urls.is_empty() {
            return Err(ConfigError::Invalid("broker.urls is empty".into()));
        }
        if self.messaging.max_message_size == 0 {
            return Err(ConfigError::Invalid("messaging.max_message_size is 0".into()));
        }
        let ceiling = MAX_FRAME_LEN as usize - FRAME_OVERHEAD;
        if self.messaging.max_message_size > ceiling {
            return Err(ConfigError::Invalid(format!(
                "messaging.max_message_size {} exceeds the broker link limit of {}",
                self.messaging.max_message_size, ceiling
            )));
        }
        if self.bridge.workers == 0 {
            return Err(ConfigError::Invalid("bridge.workers is 0".into()));
        }
        Ok(())
    }

    /// Apply environment overrides. Malformed values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("CONVO_BROKER_URLS") {
            let urls: Vec<String> = s
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                self.broker.urls = urls;
            }
        }
        if let Some(s) = var("CONVO_MAX_MESSAGE_SIZE") {
            if let Ok(n) = s.parse::<usize>() {
                if n > 0 {
                    self.messaging.max_message_size = n;
                }
            }
        }
        if let Some(s) = var("CONVO_RECEIVE_TIMEOUT_SECS") {
            if let Ok(n) = s.parse::<u64>() {
                self.endpoint.receive_timeout_secs = n;
            }
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading config");
            Config::from_file(&path)?
        }
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("CONVO_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/convo/config.toml"));
    }
    out.push(PathBuf::from("/etc/convo/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c = Config::from_toml_str("").unwrap();
        assert_eq!(c.broker.urls, vec!["local".to_string()]);
        assert_eq!(c.messaging.max_message_size, 16 * 1024 * 1024);
        assert_eq!(c.monitor.eviction, EvictionPolicy::TerminalState);
        assert!(c.monitor.check_accept);
        assert_eq!(c.bridge.workers, 4);
    }

    #[test]
    fn sections_parse() {
        let c = Config::from_toml_str(
            r#"
            [broker]
            urls = ["127.0.0.1:5673", "local"]
            stop_consume_attempts = 3

            [monitor]
            enabled = true
            eviction = "response-leg"
            roles = { client = "/etc/convo/rpc_client.toml" }
            "#,
        )
        .unwrap();
        assert_eq!(c.broker.urls.len(), 2);
        assert_eq!(c.broker.cancel_policy().attempts, 3);
        assert!(c.monitor.enabled);
        assert_eq!(c.monitor.eviction, EvictionPolicy::ResponseLeg);
        assert_eq!(
            c.monitor.roles.get("client"),
            Some(&PathBuf::from("/etc/convo/rpc_client.toml"))
        );
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(matches!(
            Config::from_toml_str("[broker]\nhost = \"x\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn zero_workers_invalid() {
        assert!(matches!(
            Config::from_toml_str("[bridge]\nworkers = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn message_size_leaves_room_in_a_frame() {
        let at_limit = MAX_FRAME_LEN as usize - FRAME_OVERHEAD;
        let ok = format!("[messaging]\nmax_message_size = {}", at_limit);
        assert!(Config::from_toml_str(&ok).is_ok());
        let over = format!("[messaging]\nmax_message_size = {}", MAX_FRAME_LEN);
        assert!(matches!(
            Config::from_toml_str(&over),
            Err(ConfigError::Invalid(_))
        ));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONVO_BROKER_URLS", "a:1, b:2"),
            ("CONVO_MAX_MESSAGE_SIZE", "1024"),
            ("CONVO_RECEIVE_TIMEOUT_SECS", "nope"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.broker.urls, vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(c.messaging.max_message_size, 1024);
        assert_eq!(c.endpoint.receive_timeout_secs, 30);
    }
}
