//! Load hub configuration from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Hub configuration. File: ~/.config/ferry/server.toml or
/// /etc/ferry/server.toml. Env overrides: FERRY_PORT, FERRY_MAX_FILE_MB,
/// FERRY_TRANSFER_IDLE_SECS, FERRY_SWEEP_INTERVAL_SECS. A positional port
/// argument overrides everything.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-file size cap in MiB (default 100).
    #[serde(default = "default_max_file_mb")]
    pub max_file_mb: u64,
    /// Idle seconds before a transfer is swept (default 300).
    #[serde(default = "default_transfer_idle_secs")]
    pub transfer_idle_secs: u64,
    /// Seconds between sweep runs (default 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_port() -> u16 {
    8888
}
fn default_max_file_mb() -> u64 {
    100
}
fn default_transfer_idle_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_file_mb: default_max_file_mb(),
            transfer_idle_secs: default_transfer_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Config {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb * 1024 * 1024
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("FERRY_PORT") {
        if let Ok(v) = s.parse::<u16>() {
            c.port = v;
        }
    }
    if let Ok(s) = std::env::var("FERRY_MAX_FILE_MB") {
        if let Ok(v) = s.parse::<u64>() {
            c.max_file_mb = v;
        }
    }
    if let Ok(s) = std::env::var("FERRY_TRANSFER_IDLE_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.transfer_idle_secs = v;
        }
    }
    if let Ok(s) = std::env::var("FERRY_SWEEP_INTERVAL_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.sweep_interval_secs = v;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ferry/server.toml"));
    }
    out.push(PathBuf::from("/etc/ferry/server.toml"));
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
