//! Load daemon config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: $CONVO_BROKER_CONFIG, ~/.config/convo/broker.toml or
/// /etc/convo/broker.toml. Env override: CONVO_LISTEN_ADDR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP address clients connect to (default 127.0.0.1:5673).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:5673".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = var("CONVO_LISTEN_ADDR") {
            if !s.trim().is_empty() {
                self.listen_addr = s.trim().to_string();
            }
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("CONVO_BROKER_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/convo/broker.toml"));
    }
    out.push(PathBuf::from("/etc/convo/broker.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config invalid, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_env() {
        let mut c: Config = toml::from_str(r#"listen_addr = "0.0.0.0:7000""#).unwrap();
        assert_eq!(c.listen_addr, "0.0.0.0:7000");
        c.apply_env(|k| (k == "CONVO_LISTEN_ADDR").then(|| " 127.0.0.1:9 ".to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:9");
        c.apply_env(|_| Some(String::new()));
        assert_eq!(c.listen_addr, "127.0.0.1:9");
    }

    #[test]
    fn empty_file_is_default() {
        assert_eq!(toml::from_str::<Config>("").unwrap(), Config::default());
        assert!(toml::from_str::<Config>("port = 1").is_err());
    }
}
