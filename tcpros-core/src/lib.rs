//!
//! Tcpros-Core is a collection of traits and contracts that layout the
//! boundary between the TCPROS transport and the collaborators it relies on.
//!
//! The transport never generates message code, never resolves names on its
//! own, and never speaks the discovery authority's RPC encoding directly.
//! Instead it consumes the traits in this crate:
//!
//! * [`Message`] and [`ServiceType`] for typed payloads,
//! * [`NameResolver`] for turning user supplied names into graph resource names,
//! * [`RpcClient`] for calling the master and peer nodes.
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub use error::{MasterError, MessageError};

pub mod message;
pub use message::{Message, ServiceType, TypeDescriptor};

pub mod name;
pub use name::{NameResolver, Namespace};

pub mod rpc;
pub use rpc::{RpcClient, RpcResponse, RpcValue};

pub mod master;
pub use master::{MasterProxy, SlaveProxy, TopicTransport};

pub mod node;
pub use node::{Node, NodeIdentity};

pub mod publisher_subscriber;
pub use publisher_subscriber::Publisher;

pub mod client_server;
pub use client_server::Client;
