//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/peerio/config.toml or
/// /etc/peerio/config.toml. Env overrides: PEERIO_DISPLAY_NAME,
/// PEERIO_DISCOVERY_PORT, PEERIO_TRANSPORT_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other peers. Unset means `peer-<short-id>`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Discovery UDP port (default 45688).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45689).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
}

fn default_discovery_port() -> u16 {
    45688
}
fn default_transport_port() -> u16 {
    45689
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PEERIO_DISPLAY_NAME") {
        if !s.is_empty() {
            c.display_name = Some(s);
        }
    }
    if let Ok(s) = std::env::var("PEERIO_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("PEERIO_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerio/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerio/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
