//! In-memory network implementing [`Sockets`].
//!
//! All hosts share one channel. A transmission occupies the channel for
//! `size * 8 / rate` and arrives one propagation delay after it finishes,
//! so frames arrive in the order they were sent.
//!
//! The network never touches the scheduler. Transmissions are buffered in an
//! outbox as `(arrival time, NetEvent)` pairs and readiness callbacks are
//! buffered as [`Notification`]s; the event loop drains both after every
//! step.

use bytes::Bytes;
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

use super::socket::{Notification, NodeId, SocketError, SocketEvent, SocketId, Sockets, Transport};
use super::AppId;
use crate::pacing::DataRate;

/// First port handed out for ephemeral binds.
const EPHEMERAL_PORT_START: u16 = 49153;

/// Shared medium parameters.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub rate: DataRate,
    pub delay: Duration,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            rate: DataRate::from_kbps(56),
            delay: Duration::from_millis(2),
        }
    }
}

/// A frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// Stream connection request.
    Connect {
        from: SocketId,
        from_addr: SocketAddr,
        to: SocketAddr,
    },
    /// Listener accepted; `peer` is the accepted socket.
    ConnectAck { to: SocketId, peer: SocketId },
    /// No listener at the destination.
    ConnectRefused { to: SocketId },
    /// Stream data.
    Segment {
        to: SocketId,
        from: SocketAddr,
        payload: Bytes,
    },
    /// Connectionless data.
    Datagram {
        from: SocketAddr,
        to: SocketAddr,
        payload: Bytes,
    },
    /// End of stream.
    Fin { to: SocketId, from: SocketAddr },
}

/// Direction of a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Transmit,
    Receive,
}

/// One line of the packet trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub time: Duration,
    pub node: NodeId,
    pub kind: TraceKind,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Open,
    Bound,
    Listening,
    Connecting,
    Connected,
    PeerClosed,
    Closed,
}

#[derive(Debug)]
struct SimSocket {
    node: NodeId,
    transport: Transport,
    state: SockState,
    /// Produced by a listener; shares the listener's local port.
    accepted: bool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    peer_socket: Option<SocketId>,
    rx: VecDeque<(Bytes, SocketAddr)>,
    /// Data sent before the connection completed.
    held: VecDeque<Bytes>,
    groups: Vec<IpAddr>,
    on_recv: Option<AppId>,
    on_accept: Option<AppId>,
    on_close: Option<AppId>,
}

impl SimSocket {
    fn new(node: NodeId, transport: Transport) -> Self {
        Self {
            node,
            transport,
            state: SockState::Open,
            accepted: false,
            local: None,
            peer: None,
            peer_socket: None,
            rx: VecDeque::new(),
            held: VecDeque::new(),
            groups: Vec::new(),
            on_recv: None,
            on_accept: None,
            on_close: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.state == SockState::Closed
    }
}

/// Hosts, sockets and the shared channel.
pub struct Network {
    nodes: Vec<Vec<IpAddr>>,
    // Closed sockets are kept so their ids are never handed out again.
    sockets: Slab<SimSocket>,
    channel: Channel,
    busy_until: Duration,
    now: Duration,
    next_port: u16,
    outbox: Vec<(Duration, NetEvent)>,
    notifications: Vec<Notification>,
    trace: Option<Vec<TraceRecord>>,
}

impl Network {
    pub fn new(channel: Channel) -> Self {
        Self {
            nodes: Vec::new(),
            sockets: Slab::new(),
            channel,
            busy_until: Duration::ZERO,
            now: Duration::ZERO,
            next_port: EPHEMERAL_PORT_START,
            outbox: Vec::new(),
            notifications: Vec::new(),
            trace: None,
        }
    }

    /// Start recording transmit/receive trace records.
    pub fn enable_trace(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    pub fn trace(&self) -> &[TraceRecord] {
        self.trace.as_deref().unwrap_or(&[])
    }

    /// Write the trace in a line-per-frame ASCII format.
    pub fn write_trace<W: Write>(&self, mut out: W) -> io::Result<()> {
        for record in self.trace() {
            let marker = match record.kind {
                TraceKind::Transmit => '+',
                TraceKind::Receive => 'r',
            };
            writeln!(
                out,
                "{} {:.6} /NodeList/{} size {}",
                marker,
                record.time.as_secs_f64(),
                record.node.0,
                record.size
            )?;
        }
        Ok(())
    }

    /// Add a host owning `addrs`.
    pub fn add_node(&mut self, addrs: Vec<IpAddr>) -> NodeId {
        self.nodes.push(addrs);
        NodeId(self.nodes.len() - 1)
    }

    pub fn node_addrs(&self, node: NodeId) -> &[IpAddr] {
        self.nodes.get(node.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Host owning `ip`, if any.
    pub fn node_of(&self, ip: IpAddr) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|addrs| addrs.contains(&ip))
            .map(NodeId)
    }

    /// Advance the network's view of the clock.
    pub fn set_now(&mut self, now: Duration) {
        self.now = now;
    }

    /// Frames transmitted since the last drain, with their arrival times.
    pub fn drain_outbox(&mut self) -> Vec<(Duration, NetEvent)> {
        std::mem::take(&mut self.outbox)
    }

    /// Readiness callbacks raised since the last drain.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Whether `socket` exists and has not been closed locally.
    pub fn is_open(&self, socket: SocketId) -> bool {
        self.sockets.get(socket.0).is_some_and(|s| !s.is_closed())
    }

    /// Messages waiting in the receive queue of `socket`.
    pub fn pending_rx(&self, socket: SocketId) -> usize {
        self.sockets.get(socket.0).map_or(0, |s| s.rx.len())
    }

    /// Handle a frame arriving at the current time.
    pub fn deliver(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connect { from, from_addr, to } => self.on_connect(from, from_addr, to),
            NetEvent::ConnectAck { to, peer } => self.on_connect_ack(to, peer),
            NetEvent::ConnectRefused { to } => self.on_connect_refused(to),
            NetEvent::Segment { to, from, payload } => self.on_segment(to, from, payload),
            NetEvent::Datagram { from, to, payload } => self.on_datagram(from, to, payload),
            NetEvent::Fin { to, from } => self.on_fin(to, from),
        }
    }

    fn socket(&self, id: SocketId) -> Result<&SimSocket, SocketError> {
        self.sockets.get(id.0).ok_or(SocketError::UnknownSocket(id))
    }

    fn socket_mut(&mut self, id: SocketId) -> Result<&mut SimSocket, SocketError> {
        self.sockets.get_mut(id.0).ok_or(SocketError::UnknownSocket(id))
    }

    fn notify(&mut self, app: Option<AppId>, socket: SocketId, event: SocketEvent) {
        if let Some(app) = app {
            self.notifications.push(Notification { app, socket, event });
        }
    }

    fn record(&mut self, node: NodeId, kind: TraceKind, size: usize) {
        let time = self.now;
        if let Some(trace) = self.trace.as_mut() {
            trace.push(TraceRecord { time, node, kind, size });
        }
    }

    /// Put a frame of `size` bytes on the channel.
    fn transmit(&mut self, node: NodeId, size: usize, event: NetEvent) {
        let start = self.now.max(self.busy_until);
        let done = start.saturating_add(self.channel.rate.transmit_time(size));
        self.busy_until = done;
        let arrival = done.saturating_add(self.channel.delay);

        self.record(node, TraceKind::Transmit, size);
        trace!(node = node.0, size, arrival = ?arrival, "Frame queued");
        self.outbox.push((arrival, event));
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
        port
    }

    fn wildcard_for(addr: &SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    /// Concrete source address for frames from `socket` towards `dest`.
    fn source_addr(&self, socket: &SimSocket, dest: &SocketAddr) -> SocketAddr {
        let local = socket.local.unwrap_or_else(|| Self::wildcard_for(dest));
        if !local.ip().is_unspecified() && !local.ip().is_multicast() {
            return local;
        }
        let ip = self
            .node_addrs(socket.node)
            .iter()
            .copied()
            .find(|ip| ip.is_ipv4() == dest.is_ipv4())
            .unwrap_or(local.ip());
        SocketAddr::new(ip, local.port())
    }

    fn port_in_use(&self, node: NodeId, transport: Transport, addr: &SocketAddr) -> bool {
        self.sockets.iter().any(|(_, s)| {
            s.node == node
                && s.transport == transport
                && !s.accepted
                && !s.is_closed()
                && s.local.is_some_and(|l| {
                    l.port() == addr.port()
                        && (l.ip() == addr.ip() || l.ip().is_unspecified() || addr.ip().is_unspecified())
                })
        })
    }

    fn ensure_bound(&mut self, id: SocketId, towards: &SocketAddr) -> Result<(), SocketError> {
        if self.socket(id)?.state == SockState::Open {
            self.bind(id, Self::wildcard_for(towards))?;
        }
        Ok(())
    }

    fn on_connect(&mut self, from: SocketId, from_addr: SocketAddr, to: SocketAddr) {
        let Some(node) = self.node_of(to.ip()) else {
            debug!(dest = %to, "Connect to unknown host");
            self.refuse(from);
            return;
        };
        self.record(node, TraceKind::Receive, 0);

        let listener = self.sockets.iter().find_map(|(id, s)| {
            let matches = s.node == node
                && s.transport == Transport::Stream
                && s.state == SockState::Listening
                && s.local.is_some_and(|l| {
                    l.port() == to.port() && (l.ip() == to.ip() || l.ip().is_unspecified())
                });
            matches.then_some((SocketId(id), s.on_accept))
        });

        let Some((listener, on_accept)) = listener else {
            debug!(dest = %to, "Connection refused");
            self.refuse(from);
            return;
        };

        let mut accepted = SimSocket::new(node, Transport::Stream);
        accepted.state = SockState::Connected;
        accepted.accepted = true;
        accepted.local = Some(to);
        accepted.peer = Some(from_addr);
        accepted.peer_socket = Some(from);
        let socket = SocketId(self.sockets.insert(accepted));

        debug!(%listener, %socket, peer = %from_addr, "Connection accepted");
        self.notify(on_accept, listener, SocketEvent::Accepted { socket, from: from_addr });
        self.transmit(node, 0, NetEvent::ConnectAck { to: from, peer: socket });
    }

    fn refuse(&mut self, to: SocketId) {
        let node = match self.sockets.get(to.0) {
            Some(s) => s.node,
            None => return,
        };
        self.transmit(node, 0, NetEvent::ConnectRefused { to });
    }

    fn on_connect_ack(&mut self, to: SocketId, peer: SocketId) {
        let Some(socket) = self.sockets.get_mut(to.0) else {
            return;
        };
        let node = socket.node;

        if socket.state != SockState::Connecting {
            // Closed while the handshake was in flight; tear down the far end.
            let from = socket.local.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            self.transmit(node, 0, NetEvent::Fin { to: peer, from });
            return;
        }

        socket.state = SockState::Connected;
        socket.peer_socket = Some(peer);
        let held: Vec<Bytes> = socket.held.drain(..).collect();
        self.record(node, TraceKind::Receive, 0);
        debug!(socket = %to, held = held.len(), "Connection established");

        for payload in held {
            if let Err(e) = self.send(to, payload) {
                debug!(socket = %to, error = %e, "Dropped held data");
            }
        }
    }

    fn on_connect_refused(&mut self, to: SocketId) {
        let Some(socket) = self.sockets.get_mut(to.0) else {
            return;
        };
        if socket.state != SockState::Connecting {
            return;
        }
        socket.state = SockState::Closed;
        socket.held.clear();
        let on_close = socket.on_close;
        self.notify(on_close, to, SocketEvent::PeerError);
    }

    fn on_segment(&mut self, to: SocketId, from: SocketAddr, payload: Bytes) {
        let Some(socket) = self.sockets.get_mut(to.0) else {
            return;
        };
        if socket.is_closed() {
            trace!(socket = %to, "Segment for closed socket dropped");
            return;
        }
        let (node, on_recv, size) = (socket.node, socket.on_recv, payload.len());
        socket.rx.push_back((payload, from));

        self.record(node, TraceKind::Receive, size);
        self.notify(on_recv, to, SocketEvent::Readable);
    }

    fn on_datagram(&mut self, from: SocketAddr, to: SocketAddr, payload: Bytes) {
        let dest_node = self.node_of(to.ip());
        let targets: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, s)| {
                s.transport == Transport::Datagram
                    && !s.is_closed()
                    && s.local.is_some_and(|l| l.port() == to.port())
            })
            .filter(|(_, s)| {
                if to.ip().is_multicast() {
                    s.groups.contains(&to.ip())
                } else {
                    Some(s.node) == dest_node
                        && s.local.is_some_and(|l| l.ip() == to.ip() || l.ip().is_unspecified())
                }
            })
            .map(|(id, _)| SocketId(id))
            .collect();

        if targets.is_empty() {
            trace!(dest = %to, "Datagram dropped, no receiver");
        }
        for id in targets {
            if let Some(socket) = self.sockets.get_mut(id.0) {
                socket.rx.push_back((payload.clone(), from));
                let (node, on_recv) = (socket.node, socket.on_recv);
                self.record(node, TraceKind::Receive, payload.len());
                self.notify(on_recv, id, SocketEvent::Readable);
            }
        }
    }

    fn on_fin(&mut self, to: SocketId, from: SocketAddr) {
        let Some(socket) = self.sockets.get_mut(to.0) else {
            return;
        };
        if !matches!(socket.state, SockState::Connected | SockState::Connecting) {
            return;
        }
        socket.state = SockState::PeerClosed;
        // Zero-length message marks end of stream.
        socket.rx.push_back((Bytes::new(), from));
        let (node, on_recv, on_close) = (socket.node, socket.on_recv, socket.on_close);

        self.record(node, TraceKind::Receive, 0);
        debug!(socket = %to, "Peer closed");
        self.notify(on_recv, to, SocketEvent::Readable);
        self.notify(on_close, to, SocketEvent::PeerClosed);
    }
}

impl Sockets for Network {
    fn create(&mut self, node: NodeId, transport: Transport) -> SocketId {
        let id = SocketId(self.sockets.insert(SimSocket::new(node, transport)));
        trace!(socket = %id, node = node.0, ?transport, "Socket created");
        id
    }

    fn bind(&mut self, id: SocketId, local: SocketAddr) -> Result<(), SocketError> {
        let socket = self.socket(id)?;
        if socket.state != SockState::Open {
            return Err(SocketError::InvalidState(id));
        }
        let (node, transport) = (socket.node, socket.transport);

        let ip = local.ip();
        if !ip.is_unspecified() && !ip.is_multicast() && !self.node_addrs(node).contains(&ip) {
            return Err(SocketError::AddressNotAvailable(ip));
        }

        let local = if local.port() == 0 {
            SocketAddr::new(ip, self.ephemeral_port())
        } else {
            local
        };
        if self.port_in_use(node, transport, &local) {
            return Err(SocketError::AddressInUse(local));
        }

        let socket = self.socket_mut(id)?;
        socket.local = Some(local);
        socket.state = SockState::Bound;
        trace!(socket = %id, %local, "Socket bound");
        Ok(())
    }

    fn listen(&mut self, id: SocketId) -> Result<(), SocketError> {
        let socket = self.socket_mut(id)?;
        match (socket.transport, socket.state) {
            (Transport::Stream, SockState::Bound) => {
                socket.state = SockState::Listening;
                Ok(())
            }
            // Listening is meaningless for datagrams; accept it as a no-op.
            (Transport::Datagram, SockState::Bound) => Ok(()),
            (_, SockState::Closed) => Err(SocketError::Closed(id)),
            _ => Err(SocketError::InvalidState(id)),
        }
    }

    fn connect(&mut self, id: SocketId, peer: SocketAddr) -> Result<(), SocketError> {
        self.ensure_bound(id, &peer)?;

        let socket = self.socket(id)?;
        if socket.state != SockState::Bound {
            return Err(match socket.state {
                SockState::Closed => SocketError::Closed(id),
                _ => SocketError::InvalidState(id),
            });
        }
        let (node, transport) = (socket.node, socket.transport);
        let from_addr = self.source_addr(socket, &peer);

        let socket = self.socket_mut(id)?;
        socket.peer = Some(peer);
        match transport {
            Transport::Datagram => {
                socket.state = SockState::Connected;
            }
            Transport::Stream => {
                socket.state = SockState::Connecting;
                debug!(socket = %id, %peer, "Connecting");
                self.transmit(
                    node,
                    0,
                    NetEvent::Connect {
                        from: id,
                        from_addr,
                        to: peer,
                    },
                );
            }
        }
        Ok(())
    }

    fn send(&mut self, id: SocketId, payload: Bytes) -> Result<usize, SocketError> {
        let socket = self.socket(id)?;
        let size = payload.len();

        match (socket.transport, socket.state) {
            (_, SockState::Closed) => Err(SocketError::Closed(id)),
            (Transport::Stream, SockState::Connecting) => {
                self.socket_mut(id)?.held.push_back(payload);
                Ok(size)
            }
            (Transport::Stream, SockState::Connected | SockState::PeerClosed) => {
                let (Some(peer), Some(to)) = (socket.peer, socket.peer_socket) else {
                    return Err(SocketError::NotConnected(id));
                };
                let from = self.source_addr(socket, &peer);
                let node = socket.node;
                self.transmit(node, size, NetEvent::Segment { to, from, payload });
                Ok(size)
            }
            (Transport::Datagram, _) => match socket.peer {
                Some(peer) => self.send_to(id, payload, peer),
                None => Err(SocketError::NotConnected(id)),
            },
            _ => Err(SocketError::NotConnected(id)),
        }
    }

    fn send_to(
        &mut self,
        id: SocketId,
        payload: Bytes,
        to: SocketAddr,
    ) -> Result<usize, SocketError> {
        let socket = self.socket(id)?;
        if socket.transport == Transport::Stream {
            return self.send(id, payload);
        }
        if socket.is_closed() {
            return Err(SocketError::Closed(id));
        }

        self.ensure_bound(id, &to)?;
        let socket = self.socket(id)?;
        let from = self.source_addr(socket, &to);
        let node = socket.node;
        let size = payload.len();
        self.transmit(node, size, NetEvent::Datagram { from, to, payload });
        Ok(size)
    }

    fn recv_from(&mut self, id: SocketId) -> Option<(Bytes, SocketAddr)> {
        let socket = self.sockets.get_mut(id.0)?;
        if socket.is_closed() {
            return None;
        }
        socket.rx.pop_front()
    }

    fn close(&mut self, id: SocketId) -> Result<(), SocketError> {
        let socket = self.socket_mut(id)?;
        let previous = socket.state;
        if previous == SockState::Closed {
            return Err(SocketError::Closed(id));
        }

        socket.state = SockState::Closed;
        socket.rx.clear();
        socket.held.clear();
        let (node, transport, peer_socket, peer) =
            (socket.node, socket.transport, socket.peer_socket, socket.peer);
        debug!(socket = %id, "Socket closed");

        if transport == Transport::Stream
            && matches!(previous, SockState::Connected | SockState::PeerClosed)
        {
            if let (Some(to), Some(peer)) = (peer_socket, peer) {
                let from = self.source_addr(self.socket(id)?, &peer);
                self.transmit(node, 0, NetEvent::Fin { to, from });
            }
        }
        Ok(())
    }

    fn join_group(&mut self, id: SocketId, group: IpAddr) -> Result<(), SocketError> {
        let socket = self.socket_mut(id)?;
        if socket.is_closed() {
            return Err(SocketError::Closed(id));
        }
        if socket.transport != Transport::Datagram {
            return Err(SocketError::GroupUnsupported(id));
        }
        if !group.is_multicast() {
            return Err(SocketError::InvalidState(id));
        }
        if !socket.groups.contains(&group) {
            socket.groups.push(group);
        }
        Ok(())
    }

    fn local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.sockets.get(id.0).and_then(|s| s.local)
    }

    fn set_recv_callback(&mut self, id: SocketId, app: Option<AppId>) {
        if let Some(socket) = self.sockets.get_mut(id.0) {
            socket.on_recv = app;
        }
    }

    fn set_accept_callback(&mut self, id: SocketId, app: Option<AppId>) {
        if let Some(socket) = self.sockets.get_mut(id.0) {
            socket.on_accept = app;
        }
    }

    fn set_close_callbacks(&mut self, id: SocketId, app: Option<AppId>) {
        if let Some(socket) = self.sockets.get_mut(id.0) {
            socket.on_close = app;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_APP: AppId = AppId(0);
    const CLIENT_APP: AppId = AppId(1);

    fn v4(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, last)), port)
    }

    fn any_v4(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    fn two_hosts() -> (Network, NodeId, NodeId) {
        let mut net = Network::new(Channel::default());
        let a = net.add_node(vec![v4(1, 0).ip()]);
        let b = net.add_node(vec![v4(2, 0).ip()]);
        (net, a, b)
    }

    /// Deliver every frame in flight, in arrival order, until quiet.
    fn settle(net: &mut Network) -> Vec<Notification> {
        let mut seen = Vec::new();
        loop {
            let mut frames = net.drain_outbox();
            if frames.is_empty() {
                return seen;
            }
            frames.sort_by_key(|(at, _)| *at);
            for (at, frame) in frames {
                net.set_now(at);
                net.deliver(frame);
                seen.extend(net.drain_notifications());
            }
        }
    }

    fn listener(net: &mut Network, node: NodeId, port: u16) -> SocketId {
        let s = net.create(node, Transport::Stream);
        net.bind(s, any_v4(port)).unwrap();
        net.listen(s).unwrap();
        net.set_accept_callback(s, Some(SERVER_APP));
        s
    }

    #[test]
    fn test_connect_accept_and_data() {
        let (mut net, a, b) = two_hosts();
        let lst = listener(&mut net, a, 8080);

        let client = net.create(b, Transport::Stream);
        net.set_recv_callback(client, Some(CLIENT_APP));
        net.connect(client, v4(1, 8080)).unwrap();
        // Held until the handshake completes.
        assert_eq!(net.send(client, Bytes::from_static(b"hello\0")), Ok(6));

        let notes = settle(&mut net);
        let accepted = match &notes[0].event {
            SocketEvent::Accepted { socket, from } => {
                assert_eq!(notes[0].socket, lst);
                assert_eq!(from.ip(), v4(2, 0).ip());
                *socket
            }
            other => panic!("unexpected: {:?}", other),
        };
        assert_ne!(accepted, lst);

        // No recv callback on the accepted socket yet; data is still queued.
        assert_eq!(net.pending_rx(accepted), 1);
        let (payload, from) = net.recv_from(accepted).unwrap();
        assert_eq!(&payload[..], b"hello\0");
        assert_eq!(from, net.local_addr(client).map(|l| SocketAddr::new(v4(2, 0).ip(), l.port())).unwrap());

        net.send(accepted, Bytes::from_static(b"reply\0")).unwrap();
        let notes = settle(&mut net);
        assert_eq!(
            notes,
            vec![Notification {
                app: CLIENT_APP,
                socket: client,
                event: SocketEvent::Readable
            }]
        );
        assert_eq!(&net.recv_from(client).unwrap().0[..], b"reply\0");
        assert!(net.recv_from(client).is_none());
    }

    #[test]
    fn test_frames_arrive_in_send_order() {
        let (mut net, a, b) = two_hosts();
        let _lst = listener(&mut net, a, 8080);
        let client = net.create(b, Transport::Stream);
        net.connect(client, v4(1, 8080)).unwrap();
        for i in 0..5u8 {
            net.send(client, Bytes::from(vec![i; 10 + usize::from(i)])).unwrap();
        }
        let notes = settle(&mut net);
        let SocketEvent::Accepted { socket, .. } = notes[0].event else {
            panic!("expected accept");
        };
        let sizes: Vec<usize> = std::iter::from_fn(|| net.recv_from(socket)).map(|(p, _)| p.len()).collect();
        assert_eq!(sizes, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_channel_timing() {
        let (mut net, a, b) = two_hosts();
        let _lst = listener(&mut net, a, 8080);
        let client = net.create(b, Transport::Stream);
        net.connect(client, v4(1, 8080)).unwrap();
        settle(&mut net);

        let now = Duration::from_secs(1);
        net.set_now(now);
        net.send(client, Bytes::from(vec![0u8; 7])).unwrap();
        let frames = net.drain_outbox();
        // 7 bytes at 56kbps is 1ms, plus 2ms propagation.
        assert_eq!(frames[0].0, now + Duration::from_millis(3));
    }

    #[test]
    fn test_connection_refused() {
        let (mut net, _a, b) = two_hosts();
        let client = net.create(b, Transport::Stream);
        net.set_close_callbacks(client, Some(CLIENT_APP));
        net.connect(client, v4(1, 9999)).unwrap();

        let notes = settle(&mut net);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].event, SocketEvent::PeerError);
        assert!(!net.is_open(client));
        assert_eq!(net.send(client, Bytes::from_static(b"x")), Err(SocketError::Closed(client)));
    }

    #[test]
    fn test_close_delivers_end_of_stream() {
        let (mut net, a, b) = two_hosts();
        let _lst = listener(&mut net, a, 8080);
        let client = net.create(b, Transport::Stream);
        net.connect(client, v4(1, 8080)).unwrap();
        let notes = settle(&mut net);
        let SocketEvent::Accepted { socket: accepted, .. } = notes[0].event else {
            panic!("expected accept");
        };
        net.set_recv_callback(accepted, Some(SERVER_APP));
        net.set_close_callbacks(accepted, Some(SERVER_APP));

        net.close(client).unwrap();
        let notes = settle(&mut net);
        let events: Vec<_> = notes.into_iter().map(|n| n.event).collect();
        assert_eq!(events, vec![SocketEvent::Readable, SocketEvent::PeerClosed]);

        let (payload, _) = net.recv_from(accepted).unwrap();
        assert!(payload.is_empty());

        // Second close fails without side effects.
        assert_eq!(net.close(client), Err(SocketError::Closed(client)));
        assert!(net.drain_outbox().is_empty());
    }

    #[test]
    fn test_closed_socket_drops_inbound() {
        let (mut net, a, b) = two_hosts();
        let _lst = listener(&mut net, a, 8080);
        let client = net.create(b, Transport::Stream);
        net.connect(client, v4(1, 8080)).unwrap();
        let notes = settle(&mut net);
        let SocketEvent::Accepted { socket: accepted, .. } = notes[0].event else {
            panic!("expected accept");
        };

        net.close(accepted).unwrap();
        net.send(client, Bytes::from_static(b"late\0")).unwrap();
        settle(&mut net);
        assert!(net.recv_from(accepted).is_none());
        assert_eq!(net.send(accepted, Bytes::from_static(b"x")), Err(SocketError::Closed(accepted)));
    }

    #[test]
    fn test_socket_ids_not_reused() {
        let (mut net, a, _b) = two_hosts();
        let first = net.create(a, Transport::Stream);
        net.close(first).unwrap();
        let second = net.create(a, Transport::Stream);
        assert_ne!(first, second);
    }

    #[test]
    fn test_bind_rules() {
        let (mut net, a, _b) = two_hosts();
        let s1 = net.create(a, Transport::Stream);
        net.bind(s1, any_v4(8080)).unwrap();
        let s2 = net.create(a, Transport::Stream);
        assert_eq!(net.bind(s2, v4(1, 8080)), Err(SocketError::AddressInUse(v4(1, 8080))));

        // Same port on another transport is fine.
        let d = net.create(a, Transport::Datagram);
        net.bind(d, any_v4(8080)).unwrap();

        let s3 = net.create(a, Transport::Stream);
        assert_eq!(
            net.bind(s3, v4(2, 80)),
            Err(SocketError::AddressNotAvailable(v4(2, 0).ip()))
        );

        let s4 = net.create(a, Transport::Stream);
        net.bind(s4, any_v4(0)).unwrap();
        assert!(net.local_addr(s4).unwrap().port() >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn test_group_membership() {
        let (mut net, a, b) = two_hosts();
        let group: IpAddr = "225.1.2.4".parse().unwrap();

        let stream = net.create(a, Transport::Stream);
        net.bind(stream, SocketAddr::new(group, 9000)).unwrap();
        assert_eq!(net.join_group(stream, group), Err(SocketError::GroupUnsupported(stream)));

        let rx = net.create(a, Transport::Datagram);
        net.bind(rx, SocketAddr::new(group, 9000)).unwrap();
        net.join_group(rx, group).unwrap();
        net.set_recv_callback(rx, Some(SERVER_APP));

        let tx = net.create(b, Transport::Datagram);
        net.send_to(tx, Bytes::from_static(b"hi\0"), SocketAddr::new(group, 9000)).unwrap();
        let notes = settle(&mut net);
        assert_eq!(notes.len(), 1);
        let (payload, from) = net.recv_from(rx).unwrap();
        assert_eq!(&payload[..], b"hi\0");
        assert_eq!(from.ip(), v4(2, 0).ip());
    }

    #[test]
    fn test_trace_records() {
        let (mut net, a, b) = two_hosts();
        net.enable_trace();
        let _lst = listener(&mut net, a, 8080);
        let client = net.create(b, Transport::Stream);
        net.connect(client, v4(1, 8080)).unwrap();
        net.send(client, Bytes::from_static(b"abc\0")).unwrap();
        settle(&mut net);

        assert!(net
            .trace()
            .iter()
            .any(|r| r.kind == TraceKind::Receive && r.node == a && r.size == 4));

        let mut out = Vec::new();
        net.write_trace(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().all(|l| l.starts_with("+ ") || l.starts_with("r ")));
        assert!(text.contains("/NodeList/0 size 4"));
    }
}
