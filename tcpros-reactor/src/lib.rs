//!
//! Tcpros-Reactor owns every socket of a node.
//!
//! The reactor is a single thread blocked on socket readiness (through
//! `mio`).  When a socket becomes ready it accepts inbound connections,
//! completes outbound connects, decodes the negotiation header of every
//! connection, hands established traffic to the connection's [`Protocol`]
//! and flushes queued writes.  Other threads never touch a socket; they talk
//! to the reactor through a [`ReactorHandle`] or a [`ConnectionHandle`],
//! both of which only enqueue commands and wake the reactor.
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub use error::ReactorError;

pub mod connection;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, Link, Protocol};

pub mod reactor;
pub use reactor::{ListenerHandle, ProtocolFactory, Reactor, ReactorHandle};
