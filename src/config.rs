use std::{collections::HashSet, fs::read_to_string, net::SocketAddr};

use anyhow::ensure;
use clap::Parser;
use serde::*;

#[derive(Deserialize, Debug, Clone)]
pub struct Node {
    /// node identifier
    ///
    /// the name this connector presents to peers during the BTP
    /// authentication handshake and to the telemetry hub. peers look the
    /// shared secret up under this name.
    #[serde(default = "Node::id")]
    pub id: String,

    /// node ILP address
    ///
    /// the connector's own address. packets addressed to it (or below
    /// it) are delivered locally; locally produced rejects carry it as
    /// `triggeredBy`.
    #[serde(default = "Node::address")]
    pub address: String,
}

impl Node {
    fn id() -> String {
        "local".to_string()
    }

    fn address() -> String {
        "private.local".to_string()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: Self::id(),
            address: Self::address(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Server {
    /// BTP listen address
    ///
    /// the address and port the connector accepts inbound peer sessions
    /// on. supports ipv4 and ipv6.
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
}

impl Server {
    fn listen() -> SocketAddr {
        "127.0.0.1:7768".parse().unwrap()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Peer {
    /// unique peer identifier, the name the peer authenticates under.
    pub id: String,

    pub direction: Direction,

    /// dial target, required for outbound peers.
    pub endpoint: Option<String>,

    /// shared secret presented (outbound) or expected (inbound) during
    /// the authentication handshake.
    pub auth_token: String,

    /// address prefixes the peer claims to serve. informational only;
    /// routing is configured through `[[routes]]`.
    #[serde(default)]
    pub prefixes: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Route {
    pub prefix: String,
    pub next_hop: String,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Telemetry {
    /// telemetry hub endpoint
    ///
    /// address of the telemetry hub this node reports to. when absent,
    /// events are counted and discarded locally.
    pub endpoint: Option<String>,

    /// outbound event queue capacity. when the publisher cannot keep up
    /// the oldest non-critical event is dropped.
    #[serde(default = "Telemetry::capacity")]
    pub capacity: usize,

    /// seconds between periodic `NodeStatus` emissions.
    #[serde(default = "Telemetry::status_interval")]
    pub status_interval: u64,
}

impl Telemetry {
    fn capacity() -> usize {
        10_000
    }

    fn status_interval() -> u64 {
        5
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            endpoint: None,
            capacity: Self::capacity(),
            status_interval: Self::status_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Router {
    /// how often one packet may re-enter this node within its expiry
    /// window before it is treated as a forwarding loop.
    #[serde(default = "Router::max_reentries")]
    pub max_reentries: u32,

    /// milliseconds kept between our response deadline and the packet
    /// expiry, so the upstream node sees our answer before its own
    /// deadline.
    #[serde(default = "Router::headroom_ms")]
    pub headroom_ms: u64,

    /// upper bound in milliseconds for one response wait.
    #[serde(default = "Router::max_response_wait_ms")]
    pub max_response_wait_ms: u64,
}

impl Router {
    fn max_reentries() -> u32 {
        16
    }

    fn headroom_ms() -> u64 {
        1_000
    }

    fn max_response_wait_ms() -> u64 {
        30_000
    }
}

impl Default for Router {
    fn default() -> Self {
        Self {
            max_reentries: Self::max_reentries(),
            headroom_ms: Self::headroom_ms(),
            max_response_wait_ms: Self::max_response_wait_ms(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
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

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub router: Router,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = Cli::parse()
            .config
            .map(|path| read_to_string(path))
            .transpose()?
            .unwrap_or_default();

        let config: Config = toml::from_str(&cfg_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        codec::packet::Address::new(&self.node.address)
            .map_err(|err| anyhow::anyhow!("invalid node address: {}", err))?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            ensure!(seen.insert(&peer.id), "duplicate peer id: {}", peer.id);
            ensure!(!peer.auth_token.is_empty(), "peer has empty auth token: {}", peer.id);
            ensure!(
                peer.direction != Direction::Outbound || peer.endpoint.is_some(),
                "outbound peer has no endpoint: {}",
                peer.id
            );
        }

        for route in &self.routes {
            ensure!(!route.prefix.is_empty(), "route with empty prefix");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.node.id, "local");
        assert_eq!(config.telemetry.capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [node]
            id = "a"
            address = "g.node-a"

            [server]
            listen = "127.0.0.1:7001"

            [[peers]]
            id = "b"
            direction = "outbound"
            endpoint = "127.0.0.1:7002"
            auth_token = "secret-ab"

            [[routes]]
            prefix = "g.node-c"
            next_hop = "b"
            priority = 1

            [telemetry]
            endpoint = "127.0.0.1:7900"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.routes[0].next_hop, "b");
    }

    #[test]
    fn outbound_peer_requires_endpoint() {
        let config: Config = toml::from_str(
            r#"
            [[peers]]
            id = "b"
            direction = "outbound"
            auth_token = "secret"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }
}
