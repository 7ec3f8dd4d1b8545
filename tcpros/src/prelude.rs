//!
//! The types most nodes need, importable with `use tcpros::prelude::*`.
//!

pub use tcpros_clients_and_servers::{CallError, ServiceError, ServiceProxy, ServiceServer};
pub use tcpros_core::{
    Message, MessageError, NameResolver, Node, RpcClient, RpcResponse, RpcValue, ServiceType,
};
pub use tcpros_publishers_and_subscribers::{Publisher, Subscriber, TopicError};

pub use crate::{NodeConfig, NodeError, Rate, RosNode, SlaveApi, Timer, TimerEvent};
