//! Process configuration surface (SPEC_FULL.md §6).
//!
//! Loaded from YAML with `serde_yaml`, the way the teacher's CLI
//! (`ahma_http_bridge::main::Args`, a `clap::Parser`) layers flags over
//! defaults — here a YAML file plays the role of `ahma_mcp`'s JSON tool
//! configs, with `clap` flags from `main.rs` applied on top.

use crate::error::{RelayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([kKmMgG])$").unwrap())
}

/// How the agent process is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Process,
    #[default]
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub websocket_host: String,
    #[serde(default = "default_ws_port")]
    pub websocket_port: u16,
    #[serde(default = "default_host")]
    pub management_host: String,
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    /// Per-session cap on the client-visible Message history (§3 "Message").
    #[serde(default = "default_message_history_limit")]
    pub message_history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket_host: default_host(),
            websocket_port: default_ws_port(),
            management_host: default_host(),
            management_port: default_management_port(),
            message_history_limit: default_message_history_limit(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ws_port() -> u16 {
    8788
}
fn default_management_port() -> u16 {
    8789
}
fn default_message_history_limit() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default = "default_docker_host")]
    pub docker_host: String,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default)]
    pub memory_limit: String,
    #[serde(default)]
    pub cpu_limit: String,
    pub workspace_host_base: PathBuf,
    #[serde(default = "default_workspace_container_path")]
    pub workspace_container_path: PathBuf,
    #[serde(default)]
    pub auto_remove: bool,
}

fn default_docker_host() -> String {
    "docker".to_string()
}
fn default_network_mode() -> String {
    "bridge".to_string()
}
fn default_workspace_container_path() -> PathBuf {
    PathBuf::from("/workspace")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub mode: AgentMode,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    pub container: Option<ContainerConfig>,
}

fn default_startup_timeout() -> u64 {
    30
}
fn default_max_sessions() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
}

/// CLI-supplied overrides layered between the file and the environment
/// (§6: "CLI flags override file values; file values override built-in
/// defaults"). Populated from `clap` flags in the binary; every field left
/// `None` leaves the file's value untouched.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub websocket_host: Option<String>,
    pub websocket_port: Option<u16>,
    pub management_host: Option<String>,
    pub management_port: Option<u16>,
}

impl RelayConfig {
    /// Parses a YAML config file from disk with no overlay applied.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("reading config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| RelayError::Config(format!("parsing config file {}: {e}", path.display())))
    }

    /// Load a YAML config file, then apply `overrides` and environment
    /// variables on top, in that precedence order, and validate the result.
    pub fn load(path: &Path, overrides: &CliOverrides) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_cli_overrides(overrides);
        config.apply_env_overrides()?;
        config.finalize()?;
        Ok(config)
    }

    fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(host) = &overrides.websocket_host {
            self.server.websocket_host = host.clone();
        }
        if let Some(port) = overrides.websocket_port {
            self.server.websocket_port = port;
        }
        if let Some(host) = &overrides.management_host {
            self.server.management_host = host.clone();
        }
        if let Some(port) = overrides.management_port {
            self.server.management_port = port;
        }
    }

    /// Validates cross-field invariants and expands the database path.
    /// Must run after CLI/env overlays are applied.
    fn finalize(&mut self) -> Result<()> {
        if self.agent.mode == AgentMode::Container && self.agent.container.is_none() {
            return Err(RelayError::Config(
                "agent.mode is \"container\" but agent.container is not set".into(),
            ));
        }
        self.database.path = expand_database_path(&self.database.path)?;
        Ok(())
    }

    /// Applies any `ACP_RELAY_SERVER_*` / `ACP_RELAY_AGENT_*` /
    /// `ACP_RELAY_DATABASE_*` env vars present, overriding whatever the
    /// file or CLI flags set. Unrecognized env vars matching the prefix are
    /// ignored.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("ACP_RELAY_SERVER_WEBSOCKET_HOST") {
            self.server.websocket_host = v;
        }
        if let Some(v) = env_var("ACP_RELAY_SERVER_WEBSOCKET_PORT") {
            self.server.websocket_port = parse_env_u16("ACP_RELAY_SERVER_WEBSOCKET_PORT", &v)?;
        }
        if let Some(v) = env_var("ACP_RELAY_SERVER_MANAGEMENT_HOST") {
            self.server.management_host = v;
        }
        if let Some(v) = env_var("ACP_RELAY_SERVER_MANAGEMENT_PORT") {
            self.server.management_port = parse_env_u16("ACP_RELAY_SERVER_MANAGEMENT_PORT", &v)?;
        }
        if let Some(v) = env_var("ACP_RELAY_SERVER_MESSAGE_HISTORY_LIMIT") {
            self.server.message_history_limit = v.parse().map_err(|_| {
                RelayError::Config(format!(
                    "ACP_RELAY_SERVER_MESSAGE_HISTORY_LIMIT: invalid integer {v:?}"
                ))
            })?;
        }
        if let Some(v) = env_var("ACP_RELAY_AGENT_COMMAND") {
            self.agent.command = v;
        }
        if let Some(v) = env_var("ACP_RELAY_AGENT_MODE") {
            self.agent.mode = match v.as_str() {
                "process" => AgentMode::Process,
                "container" => AgentMode::Container,
                other => {
                    return Err(RelayError::Config(format!(
                        "ACP_RELAY_AGENT_MODE: invalid mode {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = env_var("ACP_RELAY_DATABASE_PATH") {
            self.database.path = v;
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_env_u16(name: &str, raw: &str) -> Result<u16> {
    raw.parse()
        .map_err(|_| RelayError::Config(format!("{name}: invalid port {raw:?}")))
}

/// Expand `$XDG_*` and a leading `~/` in a configured database path.
///
/// Full XDG base-directory resolution is an external concern (SPEC_FULL.md
/// §1); this only covers the narrow expansion the config surface promises.
fn expand_database_path(raw: &str) -> Result<String> {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| RelayError::Config("cannot resolve ~ (no home directory)".into()))?;
        home.join(rest).to_string_lossy().into_owned()
    } else {
        raw.to_string()
    };

    let mut result = String::with_capacity(expanded.len());
    let mut chars = expanded.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                result.push('$');
                continue;
            }
            let value = std::env::var(&name).map_err(|_| {
                RelayError::Config(format!("database.path references unset env var ${name}"))
            })?;
            result.push_str(&value);
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

/// Parse a compact size string (`"512m"`, `"2g"`, `"256k"`, `""`) into bytes.
/// An empty string means unlimited (`None`).
pub fn parse_memory_limit(raw: &str) -> Result<Option<u64>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let caps = limit_re()
        .captures(raw.trim())
        .ok_or_else(|| RelayError::Config(format!("invalid memory limit: {raw:?}")))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid memory limit: {raw:?}")))?;
    let multiplier: u64 = match caps[2].to_ascii_lowercase().as_str() {
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => unreachable!("regex only matches kKmMgG"),
    };
    Ok(Some((value * multiplier as f64).round() as u64))
}

/// Parse a fractional CPU core count (`"1.5"`) into nanoseconds of CPU time
/// per second of wall time (`1e9`-scaled), or `None` if empty/unlimited.
pub fn parse_cpu_limit(raw: &str) -> Result<Option<u64>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let cores: f64 = raw
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid cpu limit: {raw:?}")))?;
    if cores <= 0.0 {
        return Err(RelayError::Config(format!("invalid cpu limit: {raw:?}")));
    }
    Ok(Some((cores * 1_000_000_000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("512k").unwrap(), Some(512 * 1024));
        assert_eq!(parse_memory_limit("2m").unwrap(), Some(2 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1.5g").unwrap(), Some((1.5 * 1024.0 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_memory_limit("").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_memory_limit() {
        assert!(parse_memory_limit("512").is_err());
        assert!(parse_memory_limit("big").is_err());
    }

    #[test]
    fn parses_fractional_cpu_limit() {
        assert_eq!(parse_cpu_limit("1").unwrap(), Some(1_000_000_000));
        assert_eq!(parse_cpu_limit("0.5").unwrap(), Some(500_000_000));
        assert_eq!(parse_cpu_limit("").unwrap(), None);
    }

    #[test]
    fn rejects_zero_or_negative_cpu_limit() {
        assert!(parse_cpu_limit("0").is_err());
        assert!(parse_cpu_limit("-1").is_err());
    }

    #[test]
    fn expands_tilde_and_env_in_database_path() {
        unsafe {
            std::env::set_var("ACP_RELAY_TEST_VAR", "/custom/state");
        }
        let expanded = expand_database_path("$ACP_RELAY_TEST_VAR/relay.db").unwrap();
        assert_eq!(expanded, "/custom/state/relay.db");
    }

    #[test]
    fn env_override_replaces_file_value() {
        let mut config = RelayConfig {
            server: ServerConfig::default(),
            agent: AgentConfig {
                command: "agent".into(),
                mode: AgentMode::Process,
                args: vec![],
                env: Default::default(),
                startup_timeout_seconds: 30,
                max_concurrent_sessions: 4,
                container: None,
            },
            database: DatabaseConfig { path: "/tmp/relay.db".into() },
        };
        unsafe {
            std::env::set_var("ACP_RELAY_SERVER_WEBSOCKET_PORT", "19999");
        }
        config.apply_env_overrides().unwrap();
        assert_eq!(config.server.websocket_port, 19999);
        unsafe {
            std::env::remove_var("ACP_RELAY_SERVER_WEBSOCKET_PORT");
        }
    }

    #[test]
    fn env_override_rejects_invalid_port() {
        let mut config = RelayConfig {
            server: ServerConfig::default(),
            agent: AgentConfig {
                command: "agent".into(),
                mode: AgentMode::Process,
                args: vec![],
                env: Default::default(),
                startup_timeout_seconds: 30,
                max_concurrent_sessions: 4,
                container: None,
            },
            database: DatabaseConfig { path: "/tmp/relay.db".into() },
        };
        unsafe {
            std::env::set_var("ACP_RELAY_SERVER_WEBSOCKET_PORT", "not-a-port");
        }
        assert!(config.apply_env_overrides().is_err());
        unsafe {
            std::env::remove_var("ACP_RELAY_SERVER_WEBSOCKET_PORT");
        }
    }
}
