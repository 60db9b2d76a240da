use std::{fs::read_to_string, net::SocketAddr};

use clap::Parser;
use serde::*;

#[derive(Deserialize, Debug)]
pub struct Hub {
    /// hub listen address
    ///
    /// the address both emitters (connector nodes) and subscribers
    /// (observers) connect to. a connection's role is inferred from its
    /// first useful frame.
    #[serde(default = "Hub::listen")]
    pub listen: SocketAddr,

    /// per-subscriber send queue capacity. a subscriber that falls this
    /// far behind is dropped rather than allowed to block ingestion.
    #[serde(default = "Hub::subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Hub {
    fn listen() -> SocketAddr {
        "127.0.0.1:7900".parse().unwrap()
    }

    fn subscriber_queue() -> usize {
        256
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            subscriber_queue: Self::subscriber_queue(),
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
    pub hub: Hub,
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

        Ok(toml::from_str(&cfg_str)?)
    }
}
