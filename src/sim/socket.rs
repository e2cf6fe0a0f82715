//! Socket contract consumed by the client and server applications.
//!
//! Sockets are handles into the network that owns them. Readiness is not
//! reported through stored closures: the network raises [`Notification`]s
//! addressed to whichever application registered for that callback, and the
//! event loop hands them to that application.

use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use super::AppId;

/// Stable socket identifier. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) usize);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Index of a simulated host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Transport flavour of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Reliable, ordered, connection oriented.
    #[default]
    Stream,
    /// Connectionless; supports group membership.
    Datagram,
}

/// Socket operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("socket {0} is closed")]
    Closed(SocketId),
    #[error("socket {0} is not connected")]
    NotConnected(SocketId),
    #[error("address {0} already in use")]
    AddressInUse(SocketAddr),
    #[error("address {0} does not belong to this node")]
    AddressNotAvailable(IpAddr),
    #[error("operation not valid in current state of socket {0}")]
    InvalidState(SocketId),
    #[error("socket {0} does not support group membership")]
    GroupUnsupported(SocketId),
}

/// What a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Data (or an end-of-stream marker) is waiting in the receive queue.
    Readable,
    /// A listening socket produced a new connected socket.
    Accepted { socket: SocketId, from: SocketAddr },
    /// The peer closed the connection.
    PeerClosed,
    /// The connection failed or was refused.
    PeerError,
}

/// A readiness callback addressed to an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub app: AppId,
    pub socket: SocketId,
    pub event: SocketEvent,
}

/// Operations an application may perform on the network.
pub trait Sockets {
    /// Create an unbound socket on `node`.
    fn create(&mut self, node: NodeId, transport: Transport) -> SocketId;

    /// Bind to `local`. Port 0 picks an ephemeral port.
    fn bind(&mut self, socket: SocketId, local: SocketAddr) -> Result<(), SocketError>;

    fn listen(&mut self, socket: SocketId) -> Result<(), SocketError>;

    fn connect(&mut self, socket: SocketId, peer: SocketAddr) -> Result<(), SocketError>;

    /// Send one message to the connected peer. Returns the bytes queued.
    fn send(&mut self, socket: SocketId, payload: Bytes) -> Result<usize, SocketError>;

    /// Send one message to `to`. Stream sockets ignore `to`.
    fn send_to(
        &mut self,
        socket: SocketId,
        payload: Bytes,
        to: SocketAddr,
    ) -> Result<usize, SocketError>;

    /// Pop the next received message and its source address.
    fn recv_from(&mut self, socket: SocketId) -> Option<(Bytes, SocketAddr)>;

    fn close(&mut self, socket: SocketId) -> Result<(), SocketError>;

    /// Join the multicast group `group`.
    fn join_group(&mut self, socket: SocketId, group: IpAddr) -> Result<(), SocketError>;

    fn local_addr(&self, socket: SocketId) -> Option<SocketAddr>;

    /// Route readable notifications for `socket` to `app`, or silence them.
    fn set_recv_callback(&mut self, socket: SocketId, app: Option<AppId>);

    fn set_accept_callback(&mut self, socket: SocketId, app: Option<AppId>);

    /// Route peer-closed and peer-error notifications for `socket` to `app`.
    fn set_close_callbacks(&mut self, socket: SocketId, app: Option<AppId>);
}
