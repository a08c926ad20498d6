//! Server configuration

use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use trellis_core::replication::{MasterPolicy, ReplicationConfig};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/trellis.toml";

/// Server configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Replication settings
    pub replication: ReplicationConfig,
    /// Role to take on at startup
    pub role: RoleConfig,
}

/// Initial role section
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoleConfig {
    /// Become master with this policy
    pub master: Option<MasterPolicy>,
    /// Follow the master at `host:port`
    pub slave_of: Option<String>,
}

/// Role resolved from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialRole {
    /// Designated master
    Master(MasterPolicy),
    /// Slave of `host:port`
    SlaveOf {
        /// Master host
        host: String,
        /// Master port
        port: u16,
    },
}

impl Config {
    /// Load configuration from a TOML file
    /// Returns None if the file doesn't exist or can't be parsed
    pub fn from_file(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Config file not found: {:?}", path);
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                None
            }
        }
    }

    /// Load configuration from the config file and environment variables
    /// Priority: Environment variables > config file > defaults
    pub fn load(path: impl AsRef<Path>) -> Self {
        let mut config = Self::from_file(path).unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `TRELLIS_*` overrides; unparsable values are logged and ignored
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let replication = &mut self.replication;

        if let Some(addr) = lookup("TRELLIS_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => replication.bind_addr = addr,
                Err(e) => tracing::warn!("Invalid TRELLIS_BIND_ADDR {:?}: {}", addr, e),
            }
        }

        if let Some(ms) = parse_env::<u64>(&lookup, "TRELLIS_CONNECT_TIMEOUT_MS") {
            replication.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env::<u64>(&lookup, "TRELLIS_ACK_TIMEOUT_MS") {
            replication.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_env(&lookup, "TRELLIS_MAX_CONNECTIONS") {
            replication.max_connections = max;
        }
        if let Some(capacity) = parse_env(&lookup, "TRELLIS_SLAVE_CHANNEL_CAPACITY") {
            replication.slave_channel_capacity = capacity;
        }
        if let Some(attempts) = parse_env(&lookup, "TRELLIS_MAX_FULL_RESYNC_ATTEMPTS") {
            replication.max_full_resync_attempts = attempts;
        }

        if let Some(quorum) = parse_env(&lookup, "TRELLIS_MASTER_WRITE_QUORUM") {
            self.role.master = Some(MasterPolicy::new(quorum));
        }
        if let Some(master) = lookup("TRELLIS_SLAVE_OF") {
            self.role.slave_of = Some(master);
        }
    }

    /// Resolve the startup role
    pub fn initial_role(&self) -> anyhow::Result<Option<InitialRole>> {
        match (&self.role.master, &self.role.slave_of) {
            (Some(_), Some(_)) => bail!("role.master and role.slave_of are mutually exclusive"),
            (Some(policy), None) => Ok(Some(InitialRole::Master(*policy))),
            (None, Some(addr)) => {
                let (host, port) = parse_host_port(addr)?;
                Ok(Some(InitialRole::SlaveOf { host, port }))
            }
            (None, None) => Ok(None),
        }
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let value = lookup(key)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("Invalid {} {:?}: {}", key, value, e);
            None
        }
    }
}

/// Split `host:port`
pub fn parse_host_port(addr: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("expected host:port, got {:?}", addr))?;
    if host.is_empty() {
        bail!("missing host in {:?}", addr);
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", addr))?;
    Ok((host.to_string(), port))
}
