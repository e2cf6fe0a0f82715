//! Topology, application lifetimes and the run loop.
//!
//! The world owns the scheduler, the network and every application. Each
//! step pops one event, hands it to its target, then drains the frames and
//! notifications the network produced: frames are scheduled for their
//! arrival time, notifications are delivered immediately to the registered
//! application.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::network::{Channel, Network};
use super::scheduler::Scheduler;
use super::socket::{NodeId, Notification};
use super::{AppId, Ctx, Event};
use crate::client::Client;
use crate::config::Config;
use crate::server::{Server, ServerConfig, ServerError};

/// Server hosts come first in the node list.
pub const SERVER_NODES: usize = 2;

const SERVER_START: Duration = Duration::from_secs(1);
const SERVER_STOP: Duration = Duration::from_secs(20);

/// Fatal run-loop errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{app} failed to start: {source}")]
    ServerStart { app: AppId, source: ServerError },
    #[error("sink node {sink} is out of range for {nodes} nodes")]
    SinkOutOfRange { sink: usize, nodes: usize },
}

pub enum App {
    Client(Client),
    Server(Server),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSummary {
    pub app: AppId,
    pub node: NodeId,
    pub total_rx: u64,
    pub accepted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub app: AppId,
    pub node: NodeId,
    /// Commands the sequencer moved past, including failed sends.
    pub commands_issued: usize,
    pub packets_sent: u32,
    pub responses: Vec<String>,
}

/// State of every application once the run is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Time of the last event delivered.
    pub finished_at: Duration,
    pub events: u64,
    pub sink_node: usize,
    pub source_node: usize,
    pub servers: Vec<ServerSummary>,
    pub clients: Vec<ClientSummary>,
}

impl RunSummary {
    /// Bytes received by all servers.
    pub fn total_rx(&self) -> u64 {
        self.servers.iter().map(|s| s.total_rx).sum()
    }
}

pub struct World {
    scheduler: Scheduler<Event>,
    network: Network,
    apps: Vec<App>,
    servers: Vec<AppId>,
    clients: Vec<AppId>,
    events: u64,
    sink_node: usize,
    source_node: usize,
}

impl World {
    pub fn new(channel: Channel) -> Self {
        Self {
            scheduler: Scheduler::new(),
            network: Network::new(channel),
            apps: Vec::new(),
            servers: Vec::new(),
            clients: Vec::new(),
            events: 0,
            sink_node: 0,
            source_node: 0,
        }
    }

    /// Build the two-server, `num_nodes`-client topology described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, SimError> {
        let total = config.total_nodes();
        if config.sink_node >= total {
            return Err(SimError::SinkOutOfRange {
                sink: config.sink_node,
                nodes: total,
            });
        }

        let mut world = World::new(Channel {
            rate: config.channel_rate,
            delay: config.channel_delay,
        });
        world.sink_node = config.sink_node;
        world.source_node = config.source_node;
        world.stop_at(config.stop_time);
        if config.tracing {
            world.network.enable_trace();
        }

        let nodes: Vec<NodeId> = (0..total)
            .map(|i| world.add_node(vec![node_address(i, config.use_ipv6)]))
            .collect();

        let wildcard = if config.use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let local = config
            .listen
            .unwrap_or_else(|| SocketAddr::new(wildcard, config.port));

        for &node in &nodes[..SERVER_NODES] {
            let server_config = ServerConfig {
                local,
                transport: config.transport,
                packet_size: config.server_packet_size,
                data_rate: config.server_data_rate,
                pace_responses: config.pace_responses,
            };
            let app = world.add_server(node, server_config);
            world.start_app(app, SERVER_START);
            world.stop_app(app, SERVER_STOP);
        }

        let sink = SocketAddr::new(node_address(config.sink_node, config.use_ipv6), local.port());
        for (i, &node) in nodes[SERVER_NODES..].iter().enumerate() {
            let app = world.add_client(node);
            if let Some(client) = world.client_mut(app) {
                client.setup(sink, config.packet_size, config.n_packets, config.data_rate);
            }
            let start = Duration::from_secs(2 * i as u64 + 1);
            world.start_app(app, start);
            world.stop_app(app, start + Duration::from_secs(1));
        }

        info!(
            nodes = total,
            servers = world.servers.len(),
            clients = world.clients.len(),
            %sink,
            "Topology built"
        );
        Ok(world)
    }

    pub fn add_node(&mut self, addrs: Vec<IpAddr>) -> NodeId {
        self.network.add_node(addrs)
    }

    pub fn add_server(&mut self, node: NodeId, config: ServerConfig) -> AppId {
        let id = AppId(self.apps.len());
        self.apps.push(App::Server(Server::new(id, node, config)));
        self.servers.push(id);
        id
    }

    pub fn add_client(&mut self, node: NodeId) -> AppId {
        let id = AppId(self.apps.len());
        self.apps.push(App::Client(Client::new(id, node)));
        self.clients.push(id);
        id
    }

    pub fn start_app(&mut self, app: AppId, at: Duration) {
        self.scheduler.schedule_at(at, Event::Start(app));
    }

    pub fn stop_app(&mut self, app: AppId, at: Duration) {
        self.scheduler.schedule_at(at, Event::Stop(app));
    }

    pub fn stop_at(&mut self, at: Duration) {
        self.scheduler.stop_at(at);
    }

    pub fn client(&self, app: AppId) -> Option<&Client> {
        match self.apps.get(app.0) {
            Some(App::Client(client)) => Some(client),
            _ => None,
        }
    }

    pub fn client_mut(&mut self, app: AppId) -> Option<&mut Client> {
        match self.apps.get_mut(app.0) {
            Some(App::Client(client)) => Some(client),
            _ => None,
        }
    }

    pub fn server(&self, app: AppId) -> Option<&Server> {
        match self.apps.get(app.0) {
            Some(App::Server(server)) => Some(server),
            _ => None,
        }
    }

    pub fn servers(&self) -> &[AppId] {
        &self.servers
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Deliver the next event. Returns `false` once the queue is exhausted
    /// or the stop time is reached.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let Some((now, event)) = self.scheduler.pop() else {
            return Ok(false);
        };
        self.events += 1;
        self.network.set_now(now);
        self.dispatch(event)?;
        self.flush();
        Ok(true)
    }

    /// Run until no event is left before the stop time.
    pub fn run(&mut self) -> Result<RunSummary, SimError> {
        info!(apps = self.apps.len(), "Simulation starting");
        while self.step()? {}
        let summary = self.summary();
        info!(
            finished_at = summary.finished_at.as_secs_f64(),
            events = summary.events,
            total_rx = summary.total_rx(),
            "Simulation finished"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        let servers = self
            .servers
            .iter()
            .filter_map(|&app| self.server(app))
            .map(|server| ServerSummary {
                app: server.id(),
                node: server.node(),
                total_rx: server.total_rx(),
                accepted: server.connections_accepted(),
            })
            .collect();
        let clients = self
            .clients
            .iter()
            .filter_map(|&app| self.client(app))
            .map(|client| ClientSummary {
                app: client.id(),
                node: client.node(),
                commands_issued: client.cursor(),
                packets_sent: client.packets_sent(),
                responses: client.received().to_vec(),
            })
            .collect();

        RunSummary {
            finished_at: self.scheduler.now(),
            events: self.events,
            sink_node: self.sink_node,
            source_node: self.source_node,
            servers,
            clients,
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<(), SimError> {
        let World {
            scheduler,
            network,
            apps,
            ..
        } = self;

        let app = match event {
            Event::Net(frame) => {
                network.deliver(frame);
                return Ok(());
            }
            Event::Start(app) | Event::Stop(app) | Event::Timer { app, .. } => app,
        };
        let Some(target) = apps.get_mut(app.0) else {
            warn!(%app, "Event for unknown application");
            return Ok(());
        };

        let mut ctx = Ctx {
            sockets: network,
            scheduler,
        };
        match (event, target) {
            (Event::Start(_), App::Server(server)) => {
                server
                    .start(&mut ctx)
                    .map_err(|source| SimError::ServerStart { app, source })?;
            }
            (Event::Start(_), App::Client(client)) => {
                if let Err(e) = client.start(&mut ctx) {
                    warn!(%app, error = %e, "Client failed to start");
                }
            }
            (Event::Stop(_), App::Server(server)) => server.stop(&mut ctx),
            (Event::Stop(_), App::Client(client)) => client.stop(&mut ctx),
            (Event::Timer { timer, .. }, App::Server(server)) => server.on_timer(&mut ctx, timer),
            (Event::Timer { timer, .. }, App::Client(client)) => client.on_timer(&mut ctx, timer),
            (Event::Net(_), _) => {}
        }
        Ok(())
    }

    fn flush(&mut self) {
        loop {
            let frames = self.network.drain_outbox();
            let notifications = self.network.drain_notifications();
            if frames.is_empty() && notifications.is_empty() {
                break;
            }
            for (at, frame) in frames {
                self.scheduler.schedule_at(at, Event::Net(frame));
            }
            for notification in notifications {
                self.notify(notification);
            }
        }
    }

    fn notify(&mut self, notification: Notification) {
        let Notification { app, socket, event } = notification;
        let World {
            scheduler,
            network,
            apps,
            ..
        } = self;
        let Some(target) = apps.get_mut(app.0) else {
            return;
        };
        debug!(%app, %socket, ?event, "Notification");

        let mut ctx = Ctx {
            sockets: network,
            scheduler,
        };
        match target {
            App::Server(server) => server.on_socket_event(&mut ctx, socket, event),
            App::Client(client) => client.on_socket_event(&mut ctx, socket, event),
        }
    }
}

/// Address of node `index`: 10.1.1.(index + 1) or 2001:0:f00d:cafe::(index + 1).
pub fn node_address(index: usize, ipv6: bool) -> IpAddr {
    let host = index as u128 + 1;
    if ipv6 {
        let base = u128::from(Ipv6Addr::new(0x2001, 0, 0xf00d, 0xcafe, 0, 0, 0, 0));
        IpAddr::V6(Ipv6Addr::from(base + host))
    } else {
        let base = u32::from(Ipv4Addr::new(10, 1, 1, 0));
        IpAddr::V4(Ipv4Addr::from(base.wrapping_add(host as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, TomlConfig};
    use crate::pacing::DataRate;
    use crate::protocol::{self, COMMANDS};
    use crate::server::ServerState;
    use crate::sim::Transport;

    fn config(cli: CliArgs) -> Config {
        let cli = CliArgs {
            tracing: Some(false),
            ..cli
        };
        Config::merge(cli, TomlConfig::default()).unwrap()
    }

    fn expected_responses() -> Vec<String> {
        COMMANDS
            .iter()
            .map(|c| protocol::classify(c.as_bytes()).text().into_owned())
            .collect()
    }

    fn command_bytes() -> u64 {
        COMMANDS.iter().map(|c| c.len() as u64 + 1).sum()
    }

    #[test]
    fn test_node_addresses() {
        assert_eq!(node_address(0, false), "10.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(node_address(11, false), "10.1.1.12".parse::<IpAddr>().unwrap());
        assert_eq!(node_address(0, true), "2001:0:f00d:cafe::1".parse::<IpAddr>().unwrap());
        assert_eq!(node_address(6, true), "2001:0:f00d:cafe::7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_single_client_session() {
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.servers.len(), 2);
        assert_eq!(summary.clients.len(), 1);

        // Servers are torn down at 20 s; the accept count outlives them.
        let server = world.server(world.servers()[0]).unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        assert!(server.accepted_sockets().is_empty());

        let sink = &summary.servers[0];
        assert_eq!(sink.accepted, 1);
        assert_eq!(sink.total_rx, command_bytes());
        assert_eq!(summary.servers[1].total_rx, 0);

        let client = &summary.clients[0];
        assert_eq!(client.commands_issued, 6);
        assert_eq!(client.packets_sent, 6);
        assert_eq!(client.responses, expected_responses());
        assert!(summary.finished_at < cfg.stop_time);
    }

    #[test]
    fn test_rx_log_matches_counter() {
        let cfg = config(CliArgs {
            num_nodes: Some(2),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        world.run().unwrap();

        let server = world.server(world.servers()[0]).unwrap();
        let logged: u64 = server.rx_log().iter().map(|r| r.size as u64).sum();
        assert_eq!(logged, server.total_rx());
        assert_eq!(server.rx_log().len(), 12);
        assert_eq!(server.rx_log().last().map(|r| r.total), Some(server.total_rx()));
    }

    #[test]
    fn test_default_run() {
        let cfg = config(CliArgs::default());
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.clients.len(), 10);
        assert_eq!(summary.servers[0].accepted, 10);
        assert_eq!(summary.total_rx(), 10 * command_bytes());
        for client in &summary.clients {
            assert_eq!(client.responses, expected_responses());
        }
        assert_eq!(summary.source_node, 1);
    }

    #[test]
    fn test_ipv6_run() {
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            use_ipv6: Some(true),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.servers[0].accepted, 1);
        assert_eq!(summary.clients[0].responses, expected_responses());
    }

    #[test]
    fn test_sink_on_second_server() {
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            sink_node: Some(1),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.servers[0].total_rx, 0);
        assert_eq!(summary.servers[1].total_rx, command_bytes());
    }

    #[test]
    fn test_stopped_client_never_resends() {
        // Resends are due 8320 s after each send, long after the client stops.
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            n_packets: Some(3),
            data_rate: Some("1bps".into()),
            stop_time: Some(100_000.0),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.clients[0].packets_sent, 6);
        assert_eq!(summary.servers[0].total_rx, command_bytes());
    }

    #[test]
    fn test_oversized_packet_pacing() {
        // Resend delay saturates far beyond the stop time.
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            packet_size: Some(usize::MAX),
            n_packets: Some(2),
            data_rate: Some("1bps".into()),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.clients[0].packets_sent, 6);
        assert_eq!(summary.clients[0].responses, expected_responses());
        assert!(summary.finished_at < cfg.stop_time);
    }

    #[test]
    fn test_paced_server_responses() {
        let cfg = config(CliArgs {
            num_nodes: Some(1),
            pace_responses: Some(true),
            ..Default::default()
        });
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        assert_eq!(summary.clients[0].responses, expected_responses());
    }

    #[test]
    fn test_multicast_stream_is_fatal() {
        let mut cfg = config(CliArgs::default());
        cfg.listen = Some("225.1.2.4:9000".parse().unwrap());
        let mut world = World::from_config(&cfg).unwrap();

        match world.run() {
            Err(SimError::ServerStart { source, .. }) => {
                assert!(matches!(source, ServerError::MulticastUnsupported(_)));
            }
            other => panic!("expected fatal start, got {other:?}"),
        }
    }

    #[test]
    fn test_multicast_datagram_server_starts() {
        let mut cfg = config(CliArgs::default());
        cfg.listen = Some("225.1.2.4:9000".parse().unwrap());
        cfg.transport = Transport::Datagram;
        let mut world = World::from_config(&cfg).unwrap();
        let summary = world.run().unwrap();

        // Stream clients find no listener on the group port.
        assert_eq!(summary.total_rx(), 0);
        assert!(summary.clients.iter().all(|c| c.responses.is_empty()));
    }

    #[test]
    fn test_sink_out_of_range() {
        let mut cfg = config(CliArgs::default());
        cfg.sink_node = 40;
        assert!(matches!(
            World::from_config(&cfg),
            Err(SimError::SinkOutOfRange { sink: 40, nodes: 12 })
        ));
    }

    #[test]
    fn test_trace_records_channel_activity() {
        let mut cfg = config(CliArgs {
            num_nodes: Some(1),
            ..Default::default()
        });
        cfg.tracing = true;
        let mut world = World::from_config(&cfg).unwrap();
        world.run().unwrap();

        assert!(!world.network().trace().is_empty());
        let mut out = Vec::new();
        world.network().write_trace(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().all(|l| l.starts_with("+ ") || l.starts_with("r ")));
    }

    #[test]
    fn test_manual_world() {
        let mut world = World::new(Channel {
            rate: DataRate::from_kbps(56),
            delay: Duration::from_millis(2),
        });
        let server_node = world.add_node(vec![node_address(0, false)]);
        let client_node = world.add_node(vec![node_address(1, false)]);
        let server = world.add_server(server_node, ServerConfig::new("0.0.0.0:8080".parse().unwrap()));
        let client = world.add_client(client_node);
        world
            .client_mut(client)
            .unwrap()
            .setup("10.1.1.1:8080".parse().unwrap(), 1040, 1, DataRate::from_kbps(56));
        world.start_app(server, Duration::from_secs(1));
        world.start_app(client, Duration::from_secs(2));
        world.stop_app(client, Duration::from_secs(3));

        while world.step().unwrap() {}
        assert_eq!(world.client(client).unwrap().cursor(), 6);
        assert_eq!(world.server(server).unwrap().total_rx(), command_bytes());
        assert!(world.server(client).is_none());
    }
}
