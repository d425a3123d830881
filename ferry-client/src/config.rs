//! Load client configuration from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Client configuration. File: ~/.config/ferry/client.toml or
/// /etc/ferry/client.toml. Env overrides: FERRY_SERVER_ADDR, FERRY_NAME,
/// FERRY_STORAGE_DIR. A positional server-address argument overrides the
/// configured address.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hub address (default 127.0.0.1:8888).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Display name announced to the hub (default "anon").
    #[serde(default = "default_name")]
    pub name: String,
    /// Directory completed downloads land in (default "storage").
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

fn default_server_addr() -> String {
    "127.0.0.1:8888".to_owned()
}
fn default_name() -> String {
    "anon".to_owned()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            name: default_name(),
            storage_dir: default_storage_dir(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("FERRY_SERVER_ADDR") {
        if !s.is_empty() {
            c.server_addr = s;
        }
    }
    if let Ok(s) = std::env::var("FERRY_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Ok(s) = std::env::var("FERRY_STORAGE_DIR") {
        if !s.is_empty() {
            c.storage_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/ferry/client.toml"));
    }
    out.push(PathBuf::from("/etc/ferry/client.toml"));
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
