//! Sans-I/O abstractions shared between a protocol state machine and the
//! reactor that drives it.
//!
//! A [`StateMachine`] never touches a socket directly. It consumes network
//! events through its trait methods and yields [`Io`] values describing what
//! the reactor should do next (write bytes, open or close a connection, arm a
//! timer, emit an event to the application). This keeps the protocol logic
//! deterministic and testable without any actual I/O.
#![warn(missing_docs)]

use std::fmt::Debug;
use std::net;

pub use spv_common::block::time::{LocalDuration, LocalTime};

/// A command to the reactor, emitted by a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Io<M, E, D = DisconnectReason> {
    /// Send a message to a peer.
    Write(net::SocketAddr, M),
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr, Disconnect<D>),
    /// Set a timer to fire after the given duration.
    SetTimer(LocalDuration),
    /// Emit an event to the application.
    Event(E),
}

/// The default reason a state machine gives for disconnecting a peer, when
/// the consumer doesn't define its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectReason;

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "disconnected")
    }
}

/// Why a peer connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect<D> {
    /// The user requested the disconnection.
    Command,
    /// The state machine requested the disconnection, with a protocol-level
    /// reason.
    StateMachine(D),
    /// The connection was closed or reset by the peer, or failed at the
    /// transport layer.
    ConnectionError(String),
}

impl<D: std::fmt::Display> std::fmt::Display for Disconnect<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::StateMachine(reason) => write!(f, "{}", reason),
            Self::ConnectionError(err) => write!(f, "connection error: {}", err),
        }
    }
}

impl<D> Disconnect<D> {
    /// Map the state-machine-specific reason to another type.
    pub fn map<F, U>(self, f: F) -> Disconnect<U>
    where
        F: FnOnce(D) -> U,
    {
        match self {
            Self::Command => Disconnect::Command,
            Self::StateMachine(d) => Disconnect::StateMachine(f(d)),
            Self::ConnectionError(e) => Disconnect::ConnectionError(e),
        }
    }
}

/// The direction in which a connection to a peer was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// We established the connection.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

impl Link {
    /// Whether this is an outbound link.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }

    /// Whether this is an inbound link.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }
}

/// A protocol state machine driven by a reactor.
///
/// Implementations hold all protocol state and are otherwise free of I/O:
/// every effect they want performed is returned from [`Iterator::next`] on
/// the implementing type as an [`Io`] value, consumed by a [`Reactor`].
pub trait StateMachine: Iterator<Item = Io<Self::Message, Self::Event, Self::DisconnectReason>> {
    /// The wire message type exchanged with peers.
    type Message;
    /// The application-level event type emitted to observers.
    type Event;
    /// The reason given when the state machine disconnects a peer.
    type DisconnectReason: Debug + std::fmt::Display;

    /// Called once, before the reactor starts polling for I/O.
    fn initialize(&mut self, time: LocalTime) {
        self.tick(time)
    }

    /// Called when a message is received from a peer.
    fn message_received(&mut self, addr: &net::SocketAddr, message: std::borrow::Cow<Self::Message>);

    /// Called when we've attempted to connect to a peer.
    fn attempted(&mut self, addr: &net::SocketAddr);

    /// Called when a new connection to a peer has been established.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);

    /// Called when a peer disconnected, for whatever reason.
    fn disconnected(&mut self, addr: &net::SocketAddr, reason: Disconnect<Self::DisconnectReason>);

    /// Called on every reactor wake-up, with the current local time.
    fn tick(&mut self, local_time: LocalTime);

    /// Called when a timer set via [`Io::SetTimer`] has expired.
    fn timer_expired(&mut self);
}

/// Drives a [`StateMachine`] by performing the I/O it requests and feeding
/// back the network and timer events it cares about.
pub trait Reactor<S: StateMachine> {
    /// The error type returned by the reactor's I/O operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run the given state machine to completion, listening on the given
    /// addresses for inbound connections.
    fn run(&mut self, state_machine: S, listen_addrs: &[net::SocketAddr]) -> Result<(), Self::Error>;

    /// Send a message to be delivered to the reactor's event loop, typically
    /// used to wake it up from another thread.
    fn wake(&self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_direction() {
        assert!(Link::Outbound.is_outbound());
        assert!(!Link::Inbound.is_outbound());
    }
}
