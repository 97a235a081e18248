//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use imbus_core::handshake::HandshakeOptions;
use imbus_core::{ClientRole, KeyEvent, SocketAddress};
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: $XDG_CONFIG_HOME/imbus/config.toml, ~/.config/imbus/config.toml
/// or /etc/imbus/config.toml.
/// Env overrides: IMBUS_ADDRESS, IMBUS_HANDSHAKE_TIMEOUT_MS, IMBUS_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `local:/path` or `inet:host:port`.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_accepted_roles")]
    pub accepted_roles: Vec<ClientRole>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Action name to key strings, e.g. `trigger = ["Control+space"]`.
    #[serde(default = "default_hotkeys")]
    pub hotkeys: BTreeMap<String, Vec<String>>,
}

fn default_address() -> String {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => format!("local:{}", PathBuf::from(dir).join("imbus/socket").display()),
        None => {
            let user = std::env::var("USER").unwrap_or_else(|_| "default".into());
            format!("local:/tmp/imbus-{user}/socket")
        }
    }
}
fn default_accepted_roles() -> Vec<ClientRole> {
    vec![
        ClientRole::FrontEnd,
        ClientRole::Panel,
        ClientRole::IMEngine,
        ClientRole::Config,
        ClientRole::Helper,
    ]
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}
fn default_hotkeys() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("trigger".to_string(), vec!["Control+space".to_string()]),
        (
            "next-engine".to_string(),
            vec!["Control+Shift_L+KeyRelease".to_string()],
        ),
    ])
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            accepted_roles: default_accepted_roles(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            log_level: default_log_level(),
            hotkeys: default_hotkeys(),
        }
    }
}

impl Config {
    pub fn socket_address(&self) -> Result<SocketAddress> {
        self.address
            .parse()
            .with_context(|| format!("invalid address {:?}", self.address))
    }

    pub fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            timeout: Duration::from_millis(self.handshake_timeout_ms),
            ..HandshakeOptions::default()
        }
    }

    /// Parsed hotkey bindings in action-name order. Unparseable key strings are logged and skipped.
    pub fn bindings(&self) -> Vec<(String, Vec<KeyEvent>)> {
        self.hotkeys
            .iter()
            .map(|(action, keys)| {
                let chords = keys
                    .iter()
                    .filter_map(|k| match k.parse::<KeyEvent>() {
                        Ok(ev) => Some(ev),
                        Err(e) => {
                            warn!(%action, key = %k, error = %e, "ignoring hotkey");
                            None
                        }
                    })
                    .collect();
                (action.clone(), chords)
            })
            .collect()
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(a) = var("IMBUS_ADDRESS") {
            self.address = a;
        }
        if let Some(s) = var("IMBUS_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = s.parse::<u64>() {
                self.handshake_timeout_ms = ms;
            }
        }
        if let Some(l) = var("IMBUS_LOG") {
            self.log_level = l;
        }
    }
}

/// Load config: default, then `explicit` or the first config file found, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

/// Path a reload should read: the explicit one, else the first existing default.
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(x) = std::env::var_os("XDG_CONFIG_HOME") {
        out.push(PathBuf::from(x).join("imbus/config.toml"));
    }
    if let Some(h) = std::env::var_os("HOME") {
        out.push(PathBuf::from(h).join(".config/imbus/config.toml"));
    }
    out.push(PathBuf::from("/etc/imbus/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
