use std::fs::read_to_string;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use uuid::Uuid;

use session::network;

/// `[instance.host]` — present only when this process hosts a session.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    ///
    /// Local address to bind the TCP listener to.
    ///
    #[serde(default = "HostConfig::bind")]
    pub bind: SocketAddrV4,
    ///
    /// Whether to also bind a UDP discovery responder so other processes
    /// can find this host via `enum-hosts`.
    ///
    #[serde(default = "HostConfig::respond_to_enum")]
    pub respond_to_enum: bool,
}

impl HostConfig {
    fn bind() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, network::DEFAULT_HOST_PORT)
    }

    fn respond_to_enum() -> bool {
        true
    }
}

/// `[instance.connect]` — present only when this process joins a session
/// hosted elsewhere.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectConfig {
    pub host: SocketAddrV4,
    #[serde(default)]
    pub request_data: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    ///
    /// Application identifier every participant must agree on to join
    /// the same session.
    ///
    pub application: Uuid,
    #[serde(default = "InstanceConfig::session_name")]
    pub session_name: String,
    ///
    /// Player cap; 0 means unlimited.
    ///
    #[serde(default)]
    pub max_players: u32,
    #[serde(default)]
    pub password: String,
    ///
    /// Opaque application data carried in the session description.
    /// Stored as plain UTF-8 in the config file and converted to bytes
    /// as-is; callers needing binary data should encode it themselves
    /// before decoding it back out of `Event`/`ApplicationDesc`.
    ///
    #[serde(default)]
    pub app_data: String,
    #[serde(default)]
    pub player_name: String,
    #[serde(default)]
    pub player_data: String,
    #[serde(default)]
    pub host: Option<HostConfig>,
    #[serde(default)]
    pub connect: Option<ConnectConfig>,
}

impl InstanceConfig {
    fn session_name() -> String {
        "session".to_string()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfig {
    #[serde(default = "NetworkConfig::tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "NetworkConfig::discovery_port")]
    pub discovery_port: u16,
    ///
    /// Maximum I/O registrations a single worker-pool thread handles
    /// before a new thread is spawned.
    ///
    #[serde(default = "NetworkConfig::handles_per_block")]
    pub handles_per_block: usize,
}

impl NetworkConfig {
    fn tcp_port() -> u16 {
        network::DEFAULT_HOST_PORT
    }

    fn discovery_port() -> u16 {
        network::DISCOVERY_PORT
    }

    fn handles_per_block() -> usize {
        64
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_port: Self::tcp_port(),
            discovery_port: Self::discovery_port(),
            handles_per_block: Self::handles_per_block(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub instance: InstanceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: peer8 --config /etc/peer8/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configuration from the file named on the command line.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(&Cli::parse().config)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parses_from_str() {
        assert!(matches!(LogLevel::from_str("debug"), Ok(LogLevel::Debug)));
        assert!(LogLevel::from_str("nonsense").is_err());
    }
}
