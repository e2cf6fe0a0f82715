//! mftp-sim: a mini-FTP exchange over a simulated shared channel
//!
//! Clients issue a fixed sequence of six commands, one per response, and
//! the servers answer each from a small table of canned replies.
//!
//! Features:
//! - Deterministic discrete-event scheduler and in-memory socket layer
//! - Stream and datagram transports, multicast groups for datagrams
//! - IPv4 or IPv6 addressing
//! - Optional ASCII packet trace
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod pacing;
mod protocol;
mod server;
mod sim;

use config::Config;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sim::World;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let default_level = if config.verbose {
        config.log_level.as_str()
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        num_nodes = config.num_nodes,
        sink_node = config.sink_node,
        source_node = config.source_node,
        use_ipv6 = config.use_ipv6,
        packet_size = config.packet_size,
        n_packets = config.n_packets,
        data_rate = %config.data_rate,
        transport = ?config.transport,
        stop_time = config.stop_time.as_secs_f64(),
        "Starting mftp-sim"
    );

    let mut world = World::from_config(&config)?;
    let summary = world.run()?;

    for server in &summary.servers {
        info!(
            app = %server.app,
            node = %server.node,
            total_rx = server.total_rx,
            accepted = server.accepted,
            "Server summary"
        );
    }
    for client in &summary.clients {
        info!(
            app = %client.app,
            node = %client.node,
            commands = client.commands_issued,
            packets = client.packets_sent,
            responses = client.responses.len(),
            "Client summary"
        );
    }

    if config.tracing {
        let path = format!("{}.tr", config.trace_prefix);
        let mut out = BufWriter::new(File::create(&path)?);
        world.network().write_trace(&mut out)?;
        out.flush()?;
        info!(path = %path, records = world.network().trace().len(), "Trace written");
    }

    Ok(())
}
