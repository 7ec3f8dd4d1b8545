//!
//! # TCPROS
//!
//! A node-based publish/subscribe and service transport speaking the TCPROS
//! wire protocol.
//!
//! ## Technical Overview
//!
//! A process joins the graph as a [`RosNode`].  The node owns a single
//! reactor thread servicing every socket: listeners for subscribers and
//! service clients, outbound connections to publishers and service
//! providers, and the header negotiation preceding every payload.  Messages
//! and service requests received on the reactor are queued, and only handed
//! to user callbacks when the node is spun from the caller's own thread.
//!
//! ```rust,ignore
//! let config = NodeConfig::from_env("talker")?.with_node_uri(rpc_server.uri());
//! let node = RosNode::new(config, rpc_client)?;
//!
//! let chatter = node.advertise::<String>("chatter", false)?;
//! chatter.publish(&"hello".to_string())?;
//!
//! let _listener = node.subscribe("chatter", |message: String| println!("{message}"))?;
//! node.spin();
//! ```
//!
//! The master and peer nodes are reached through an [`RpcClient`](core::RpcClient)
//! supplied by the application, and the node's own RPC server forwards peer
//! calls to [`SlaveApi::dispatch`].
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub use config::{ConfigError, NodeConfig};

pub mod error;
pub use error::NodeError;

pub mod node;
pub use node::RosNode;

pub mod slave;
pub use slave::SlaveApi;

pub mod time;
pub use time::{Rate, Timer, TimerEvent};

pub mod prelude;

/// TCPROS Clients and Servers
pub use tcpros_clients_and_servers as client_servers;
/// TCPROS Core Traits
pub use tcpros_core as core;
/// TCPROS Publishers and Subscribers
pub use tcpros_publishers_and_subscribers as pubsubs;
/// TCPROS Reactor
pub use tcpros_reactor as reactor;
/// TCPROS Wire Format
pub use tcpros_wire as wire;
