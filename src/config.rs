//! Configuration module for the mini-FTP simulation.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pacing::DataRate;
use crate::sim::Transport;

/// Command-line arguments for the simulation
#[derive(Parser, Debug, Default)]
#[command(name = "mftp-sim")]
#[command(version = "0.1.0")]
#[command(about = "Mini-FTP client/server over a simulated shared channel", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Size of the application packet in bytes, used for pacing
    #[arg(long)]
    pub packet_size: Option<usize>,

    /// Number of packets each client sends before relying on responses
    #[arg(long)]
    pub n_packets: Option<u32>,

    /// Number of client nodes
    #[arg(long)]
    pub num_nodes: Option<usize>,

    /// Node whose address the clients connect to
    #[arg(long)]
    pub sink_node: Option<usize>,

    /// Sender node number (reported only)
    #[arg(long)]
    pub source_node: Option<usize>,

    /// Use IPv6 addressing
    #[arg(long)]
    pub use_ipv6: Option<bool>,

    /// Write an ASCII packet trace
    #[arg(long)]
    pub tracing: Option<bool>,

    /// Log protocol activity at info level
    #[arg(long)]
    pub verbose: Option<bool>,

    /// Simulation stop time in seconds
    #[arg(long)]
    pub stop_time: Option<f64>,

    /// Client pacing rate (e.g. 56kbps)
    #[arg(long)]
    pub data_rate: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server transport
    #[arg(long, value_enum)]
    pub transport: Option<TransportType>,

    /// Pace server responses
    #[arg(long)]
    pub pace_responses: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Server transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Stream,
    Datagram,
}

impl From<TransportType> for Transport {
    fn from(value: TransportType) -> Self {
        match value {
            TransportType::Stream => Transport::Stream,
            TransportType::Datagram => Transport::Datagram,
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Topology and run settings
#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_num_nodes")]
    pub num_nodes: usize,
    #[serde(default)]
    pub sink_node: usize,
    #[serde(default = "default_source_node")]
    pub source_node: usize,
    #[serde(default)]
    pub use_ipv6: bool,
    #[serde(default = "default_stop_time")]
    pub stop_time_secs: f64,
    #[serde(default = "default_true")]
    pub tracing: bool,
    #[serde(default = "default_trace_prefix")]
    pub trace_prefix: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_nodes: default_num_nodes(),
            sink_node: 0,
            source_node: default_source_node(),
            use_ipv6: false,
            stop_time_secs: default_stop_time(),
            tracing: true,
            trace_prefix: default_trace_prefix(),
        }
    }
}

/// Client application settings
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_n_packets")]
    pub n_packets: u32,
    #[serde(default)]
    pub data_rate: DataRate,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            n_packets: default_n_packets(),
            data_rate: DataRate::default(),
        }
    }
}

/// Server application settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit bind address; defaults to the wildcard address on `port`
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub transport: TransportType,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default)]
    pub data_rate: DataRate,
    #[serde(default)]
    pub pace_responses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            listen: None,
            transport: TransportType::Stream,
            packet_size: default_packet_size(),
            data_rate: DataRate::default(),
            pace_responses: false,
        }
    }
}

/// Shared channel settings
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub channel_rate: DataRate,
    #[serde(default = "default_channel_delay_ms")]
    pub channel_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel_rate: DataRate::default(),
            channel_delay_ms: default_channel_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            verbose: true,
        }
    }
}

fn default_num_nodes() -> usize {
    10
}

fn default_source_node() -> usize {
    1
}

fn default_stop_time() -> f64 {
    23.0
}

fn default_true() -> bool {
    true
}

fn default_trace_prefix() -> String {
    "mftp".to_string()
}

fn default_packet_size() -> usize {
    1040
}

fn default_n_packets() -> u32 {
    1
}

fn default_port() -> u16 {
    8080
}

fn default_channel_delay_ms() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub num_nodes: usize,
    pub sink_node: usize,
    pub source_node: usize,
    pub use_ipv6: bool,
    pub stop_time: Duration,
    pub tracing: bool,
    pub trace_prefix: String,

    pub packet_size: usize,
    pub n_packets: u32,
    pub data_rate: DataRate,

    pub port: u16,
    pub listen: Option<SocketAddr>,
    pub transport: Transport,
    pub server_packet_size: usize,
    pub server_data_rate: DataRate,
    pub pace_responses: bool,

    pub channel_rate: DataRate,
    pub channel_delay: Duration,

    pub log_level: String,
    pub verbose: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            simulation,
            client,
            server,
            network,
            logging,
        } = toml_config;

        let data_rate = match cli.data_rate {
            Some(rate) => rate
                .parse()
                .map_err(|e| ConfigError::Invalid("data_rate", format!("{e}")))?,
            None => client.data_rate,
        };

        let stop_secs = cli.stop_time.unwrap_or(simulation.stop_time_secs);
        if stop_secs <= 0.0 {
            return Err(ConfigError::Invalid("stop_time", stop_secs.to_string()));
        }
        let stop_time = Duration::try_from_secs_f64(stop_secs)
            .map_err(|e| ConfigError::Invalid("stop_time", format!("{stop_secs}: {e}")))?;

        let config = Config {
            num_nodes: cli.num_nodes.unwrap_or(simulation.num_nodes),
            sink_node: cli.sink_node.unwrap_or(simulation.sink_node),
            source_node: cli.source_node.unwrap_or(simulation.source_node),
            use_ipv6: cli.use_ipv6.unwrap_or(simulation.use_ipv6),
            stop_time,
            tracing: cli.tracing.unwrap_or(simulation.tracing),
            trace_prefix: simulation.trace_prefix,

            packet_size: cli.packet_size.unwrap_or(client.packet_size),
            n_packets: cli.n_packets.unwrap_or(client.n_packets),
            data_rate,

            port: cli.port.unwrap_or(server.port),
            listen: server.listen,
            transport: cli.transport.unwrap_or(server.transport).into(),
            server_packet_size: server.packet_size,
            server_data_rate: server.data_rate,
            pace_responses: cli.pace_responses.unwrap_or(server.pace_responses),

            channel_rate: network.channel_rate,
            channel_delay: Duration::from_millis(network.channel_delay_ms),

            log_level: cli.log_level.unwrap_or(logging.level),
            verbose: cli.verbose.unwrap_or(logging.verbose),
        };

        config.validate()?;
        Ok(config)
    }

    /// Total simulated hosts: two servers followed by the clients.
    pub fn total_nodes(&self) -> usize {
        crate::sim::SERVER_NODES.saturating_add(self.num_nodes)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::Invalid("num_nodes", "must be at least 1".into()));
        }
        if self.sink_node >= self.total_nodes() {
            return Err(ConfigError::Invalid(
                "sink_node",
                format!("{} is out of range for {} nodes", self.sink_node, self.total_nodes()),
            ));
        }
        if self.n_packets == 0 {
            return Err(ConfigError::Invalid("n_packets", "must be at least 1".into()));
        }
        if self.packet_size == 0 || self.server_packet_size == 0 {
            return Err(ConfigError::Invalid("packet_size", "must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
