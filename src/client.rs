//! Command sequencer.
//!
//! Connects to the server and walks the fixed command list: the first
//! command goes out on start, and every inbound message (including an
//! end-of-stream marker) releases the next one. After the last command the
//! session goes quiet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::{debug, info, warn};

use crate::pacing::{transmit_delay, DataRate};
use crate::protocol::{self, COMMANDS};
use crate::sim::{
    AppId, Ctx, Event, EventId, NodeId, SocketError, SocketEvent, SocketId, Timer, Transport,
};

/// Per-connection client state.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: SocketAddr,
    pub packet_size: usize,
    /// Total packets to send; more than one enables paced re-sends.
    pub n_packets: u32,
    pub data_rate: DataRate,
    /// Index of the next command to send.
    pub cursor: usize,
    pub packets_sent: u32,
    pub running: bool,
}

impl Session {
    pub fn new(peer: SocketAddr, packet_size: usize, n_packets: u32, data_rate: DataRate) -> Self {
        Self {
            peer,
            packet_size,
            n_packets,
            data_rate,
            cursor: 0,
            packets_sent: 0,
            running: false,
        }
    }
}

pub struct Client {
    id: AppId,
    node: NodeId,
    socket: Option<SocketId>,
    session: Option<Session>,
    send_event: Option<EventId>,
    received: Vec<String>,
}

impl Client {
    pub fn new(id: AppId, node: NodeId) -> Self {
        Self {
            id,
            node,
            socket: None,
            session: None,
            send_event: None,
            received: Vec::new(),
        }
    }

    /// Configure the session and rewind the command cursor.
    pub fn setup(&mut self, peer: SocketAddr, packet_size: usize, n_packets: u32, data_rate: DataRate) {
        debug!(app = %self.id, %peer, packet_size, n_packets, %data_rate, "Client setup");
        self.session = Some(Session::new(peer, packet_size, n_packets, data_rate));
    }

    /// Connect and send the first command.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) -> Result<(), SocketError> {
        let Some(session) = self.session.as_mut() else {
            warn!(app = %self.id, "Client started without setup");
            return Ok(());
        };
        session.running = true;
        session.packets_sent = 0;
        let peer = session.peer;
        info!(app = %self.id, node = %self.node, %peer, "Client starting");

        let socket = ctx.sockets.create(self.node, Transport::Stream);
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        ctx.sockets.bind(socket, local)?;
        ctx.sockets.set_recv_callback(socket, Some(self.id));
        ctx.sockets.set_close_callbacks(socket, Some(self.id));
        ctx.sockets.connect(socket, peer)?;
        self.socket = Some(socket);

        self.send_next_command(ctx);
        Ok(())
    }

    /// Cancel any pending re-send and close the connection.
    pub fn stop(&mut self, ctx: &mut Ctx<'_>) {
        info!(app = %self.id, "Client stopping");
        if let Some(session) = self.session.as_mut() {
            session.running = false;
        }

        if let Some(event) = self.send_event.take() {
            ctx.scheduler.cancel(event);
        }

        if let Some(socket) = self.socket.take() {
            if let Err(e) = ctx.sockets.close(socket) {
                debug!(app = %self.id, error = %e, "Close failed");
            }
        }
    }

    pub fn on_socket_event(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, event: SocketEvent) {
        match event {
            SocketEvent::Readable => self.handle_read(ctx, socket),
            SocketEvent::PeerClosed | SocketEvent::PeerError => {
                warn!(app = %self.id, %socket, ?event, "Client connection lost");
            }
            SocketEvent::Accepted { .. } => {}
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, timer: Timer) {
        if let Timer::ClientSend { command } = timer {
            self.send_event = None;
            self.send_packet(ctx, command);
        }
    }

    fn handle_read(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        if let Some((payload, from)) = ctx.sockets.recv_from(socket) {
            let text = protocol::decode_text(&payload).into_owned();
            info!(app = %self.id, %from, payload = ?text, "Client received response");
            if !payload.is_empty() {
                self.received.push(text);
            }
        }
        self.send_next_command(ctx);
    }

    fn send_next_command(&mut self, ctx: &mut Ctx<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.cursor < COMMANDS.len() {
            let command = session.cursor;
            session.cursor += 1;
            self.send_packet(ctx, command);
        }
    }

    fn send_packet(&mut self, ctx: &mut Ctx<'_>, command: usize) {
        let (Some(socket), Some(payload)) = (self.socket, protocol::command(command)) else {
            return;
        };

        let size = payload.len();
        if let Err(e) = ctx.sockets.send(socket, payload) {
            warn!(app = %self.id, command = COMMANDS[command].trim_end(), error = %e, "Client send failed");
            return;
        }
        info!(
            app = %self.id,
            time = ctx.now().as_secs_f64(),
            bytes = size,
            command = COMMANDS[command].trim_end(),
            "Client sent command"
        );

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.packets_sent += 1;
        if session.packets_sent < session.n_packets {
            self.schedule_tx(ctx, command);
        }
    }

    fn schedule_tx(&mut self, ctx: &mut Ctx<'_>, command: usize) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.running {
            let delay = transmit_delay(session.packet_size, session.data_rate);
            let timer = Timer::ClientSend { command };
            self.send_event = Some(ctx.scheduler.schedule(delay, Event::Timer { app: self.id, timer }));
        }
    }

    pub fn id(&self) -> AppId {
        self.id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Number of commands issued so far. A command whose send failed still
    /// counts; `packets_sent` only counts successful sends.
    pub fn cursor(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.cursor)
    }

    pub fn packets_sent(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.packets_sent)
    }

    /// Response texts received, in arrival order.
    pub fn received(&self) -> &[String] {
        &self.received
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.socket
    }
}
