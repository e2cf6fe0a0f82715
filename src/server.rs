//! Mini-FTP server.
//!
//! Owns one listening socket and the sockets it accepts. Every readable
//! message is classified and answered on the socket it arrived on, and its
//! size is added to the receive byte counter.

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pacing::{transmit_delay, DataRate};
use crate::protocol;
use crate::sim::{
    AppId, Ctx, Event, EventId, NodeId, SocketError, SocketEvent, SocketId, Timer, Transport,
};

/// Server packet size used for response pacing.
pub const DEFAULT_PACKET_SIZE: usize = 1040;

/// Server application settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listening socket to.
    pub local: SocketAddr,
    pub transport: Transport,
    pub packet_size: usize,
    pub data_rate: DataRate,
    /// Queue responses and send one per pacing delay.
    pub pace_responses: bool,
}

impl ServerConfig {
    pub fn new(local: SocketAddr) -> Self {
        Self {
            local,
            transport: Transport::Stream,
            packet_size: DEFAULT_PACKET_SIZE,
            data_rate: DataRate::from_kbps(56),
            pace_responses: false,
        }
    }
}

/// Fatal server startup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("cannot join multicast group {0} on a stream socket")]
    MulticastUnsupported(SocketAddr),
    #[error("socket setup failed: {0}")]
    Socket(#[from] SocketError),
}

/// Lifecycle of the listening side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Closed,
}

/// One counted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxRecord {
    pub time: Duration,
    pub from: SocketAddr,
    pub size: usize,
    /// Byte counter after this message.
    pub total: u64,
}

pub struct Server {
    id: AppId,
    node: NodeId,
    config: ServerConfig,
    state: ServerState,
    running: bool,
    socket: Option<SocketId>,
    accepted: Vec<SocketId>,
    /// Connections accepted since creation; survives teardown.
    accepted_total: usize,
    total_rx: u64,
    rx_log: Vec<RxRecord>,
    /// Responses waiting for the pacing timer.
    outgoing: VecDeque<(SocketId, SocketAddr, Bytes)>,
    send_event: Option<EventId>,
}

impl Server {
    pub fn new(id: AppId, node: NodeId, config: ServerConfig) -> Self {
        Self {
            id,
            node,
            config,
            state: ServerState::Idle,
            running: false,
            socket: None,
            accepted: Vec::new(),
            accepted_total: 0,
            total_rx: 0,
            rx_log: Vec::new(),
            outgoing: VecDeque::new(),
            send_event: None,
        }
    }

    /// Open the listening socket (once) and register callbacks.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) -> Result<(), ServerError> {
        info!(app = %self.id, node = %self.node, local = %self.config.local, "Server starting");
        self.running = true;

        let socket = match self.socket {
            Some(socket) => socket,
            None => {
                let local = self.config.local;
                let socket = ctx.sockets.create(self.node, self.config.transport);
                ctx.sockets.bind(socket, local)?;
                ctx.sockets.listen(socket)?;

                if local.ip().is_multicast() {
                    ctx.sockets.join_group(socket, local.ip()).map_err(|e| match e {
                        SocketError::GroupUnsupported(_) => ServerError::MulticastUnsupported(local),
                        other => ServerError::Socket(other),
                    })?;
                }
                self.socket = Some(socket);
                socket
            }
        };

        ctx.sockets.set_recv_callback(socket, Some(self.id));
        ctx.sockets.set_accept_callback(socket, Some(self.id));
        ctx.sockets.set_close_callbacks(socket, Some(self.id));
        self.state = ServerState::Listening;
        Ok(())
    }

    /// Close accepted sockets, then the listener, and drop pending sends.
    pub fn stop(&mut self, ctx: &mut Ctx<'_>) {
        info!(app = %self.id, total_rx = self.total_rx, "Server stopping");
        self.running = false;

        if let Some(event) = self.send_event.take() {
            ctx.scheduler.cancel(event);
        }
        self.outgoing.clear();

        for socket in self.accepted.drain(..) {
            if let Err(e) = ctx.sockets.close(socket) {
                debug!(app = %self.id, %socket, error = %e, "Close failed");
            }
        }

        if let Some(socket) = self.socket {
            if let Err(e) = ctx.sockets.close(socket) {
                debug!(app = %self.id, %socket, error = %e, "Close failed");
            }
            ctx.sockets.set_recv_callback(socket, None);
        }
        self.state = ServerState::Closed;
    }

    pub fn on_socket_event(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, event: SocketEvent) {
        match event {
            SocketEvent::Readable => self.handle_read(ctx, socket),
            SocketEvent::Accepted { socket: accepted, from } => self.handle_accept(ctx, accepted, from),
            SocketEvent::PeerClosed => {
                info!(app = %self.id, %socket, "Server peer closed");
            }
            SocketEvent::PeerError => {
                warn!(app = %self.id, %socket, "Server peer error");
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, timer: Timer) {
        if timer != Timer::ServerSend {
            return;
        }
        self.send_event = None;
        if let Some((socket, to, payload)) = self.outgoing.pop_front() {
            self.send_packet(ctx, socket, to, payload);
        }
        if !self.outgoing.is_empty() {
            self.schedule_tx(ctx);
        }
    }

    fn handle_accept(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, from: SocketAddr) {
        info!(app = %self.id, %socket, %from, "Server accepted connection");
        ctx.sockets.set_recv_callback(socket, Some(self.id));
        ctx.sockets.set_close_callbacks(socket, Some(self.id));
        self.accepted.push(socket);
        self.accepted_total += 1;
    }

    /// Drain every message waiting on `socket`.
    fn handle_read(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        while let Some((packet, from)) = ctx.sockets.recv_from(socket) {
            if packet.is_empty() {
                debug!(app = %self.id, %socket, "End of stream");
                break;
            }

            let request = protocol::decode_text(&packet);
            let response = protocol::classify(&packet);
            info!(
                app = %self.id,
                request = ?request,
                code = response.code(),
                "Server received request"
            );
            self.transmit(ctx, socket, from, response.encode());

            let size = packet.len();
            self.total_rx += size as u64;
            info!(
                time = ctx.now().as_secs_f64(),
                bytes = size,
                from = %from.ip(),
                port = from.port(),
                total_rx = self.total_rx,
                "Server received bytes"
            );
            self.rx_log.push(RxRecord {
                time: ctx.now(),
                from,
                size,
                total: self.total_rx,
            });
        }
    }

    fn transmit(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, to: SocketAddr, payload: Bytes) {
        if !self.config.pace_responses {
            self.send_packet(ctx, socket, to, payload);
            return;
        }
        self.outgoing.push_back((socket, to, payload));
        if self.send_event.is_none() {
            self.schedule_tx(ctx);
        }
    }

    fn send_packet(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, to: SocketAddr, payload: Bytes) {
        debug!(app = %self.id, %socket, response = ?protocol::decode_text(&payload), "Server sending");
        if let Err(e) = ctx.sockets.send_to(socket, payload, to) {
            warn!(app = %self.id, %socket, error = %e, "Server send failed");
        }
    }

    fn schedule_tx(&mut self, ctx: &mut Ctx<'_>) {
        if self.running {
            let delay = transmit_delay(self.config.packet_size, self.config.data_rate);
            let event = Event::Timer {
                app: self.id,
                timer: Timer::ServerSend,
            };
            self.send_event = Some(ctx.scheduler.schedule(delay, event));
        }
    }

    pub fn id(&self) -> AppId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Total bytes received across all connections.
    pub fn total_rx(&self) -> u64 {
        self.total_rx
    }

    pub fn listening_socket(&self) -> Option<SocketId> {
        self.socket
    }

    /// Connections currently held open.
    pub fn accepted_sockets(&self) -> &[SocketId] {
        &self.accepted
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted_total
    }

    pub fn rx_log(&self) -> &[RxRecord] {
        &self.rx_log
    }
}
