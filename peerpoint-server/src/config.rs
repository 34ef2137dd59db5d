//! Server configuration.
//!
//! Every option can be given as a flag or through its environment
//! variable; flags win.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::{Parser, ValueEnum};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default burst capacity for control-message rate limiting.
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 100;
/// Default sustained rate for control-message rate limiting (per second).
pub const DEFAULT_RATE_LIMIT_SUSTAINED: u32 = 10;

/// Public STUN servers handed to server-side peer connections.
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// How the relay treats signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RelayMode {
    /// The relay is every client's remote peer and relays data-channel
    /// traffic between them.
    Hub,
    /// The relay only forwards signaling between clients, which then
    /// connect to each other directly.
    Forward,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Forward => write!(f, "forward"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Command-line and environment configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "peerpoint", version, about = "Peerpoint signaling relay")]
pub struct ServerConfig {
    /// Address to bind.
    #[arg(long, env = "PEERPOINT_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to bind.
    #[arg(long, short, env = "PEERPOINT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Relay mode.
    #[arg(long, env = "PEERPOINT_MODE", value_enum, default_value_t = RelayMode::Hub)]
    pub mode: RelayMode,

    /// ICE server URLs for server-side peer connections (hub mode).
    #[arg(
        long = "ice-server",
        env = "PEERPOINT_ICE_SERVERS",
        value_delimiter = ',',
        default_values_t = default_ice_servers()
    )]
    pub ice_servers: Vec<String>,

    /// Control-message burst capacity per connection.
    #[arg(long, env = "WS_RATE_LIMIT_BURST", default_value_t = DEFAULT_RATE_LIMIT_BURST)]
    pub rate_limit_burst: u32,

    /// Control messages per second sustained per connection.
    #[arg(long, env = "WS_RATE_LIMIT_SUSTAINED", default_value_t = DEFAULT_RATE_LIMIT_SUSTAINED)]
    pub rate_limit_sustained: u32,

    /// Log output format.
    #[arg(long, env = "RUST_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Socket address to bind.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            mode: RelayMode::Hub,
            ice_servers: default_ice_servers(),
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            rate_limit_sustained: DEFAULT_RATE_LIMIT_SUSTAINED,
            log_format: LogFormat::Pretty,
        }
    }
}

fn default_ice_servers() -> Vec<String> {
    DEFAULT_ICE_SERVERS.iter().map(ToString::to_string).collect()
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}
