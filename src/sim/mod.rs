//! Deterministic simulation substrate.
//!
//! - `Scheduler`: logical clock and ordered event queue
//! - `Sockets`: socket contract used by the applications
//! - `Network`: in-memory implementation of that contract
//! - `World`: topology, application lifetimes and the run loop

mod network;
mod scheduler;
mod socket;
mod world;

pub use network::NetEvent;
pub use scheduler::{EventId, Scheduler};
pub use socket::{NodeId, SocketError, SocketEvent, SocketId, Sockets, Transport};
pub use world::{World, SERVER_NODES};

#[cfg(test)]
pub use network::{Channel, Network};

use std::fmt;
use std::time::Duration;

/// Index of an application in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub usize);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}", self.0)
    }
}

/// Timers an application can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Client re-sends command `command` after a pacing delay.
    ClientSend { command: usize },
    /// Server transmits the next queued response.
    ServerSend,
}

/// Everything the scheduler can fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(AppId),
    Stop(AppId),
    Timer { app: AppId, timer: Timer },
    Net(NetEvent),
}

/// What an application sees while handling a callback.
pub struct Ctx<'a> {
    pub sockets: &'a mut dyn Sockets,
    pub scheduler: &'a mut Scheduler<Event>,
}

impl Ctx<'_> {
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }
}
