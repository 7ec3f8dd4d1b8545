//!
//! Errors from starting and driving a node.
//!

use thiserror::Error;

use tcpros_clients_and_servers::ServiceError;
use tcpros_core::MasterError;
use tcpros_publishers_and_subscribers::TopicError;
use tcpros_reactor::ReactorError;

use crate::config::ConfigError;

/// An error from a [`RosNode`](crate::RosNode) operation
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node's configuration is incomplete or invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The reactor could not be started
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
    /// A topic operation failed
    #[error("topic error: {0}")]
    Topic(#[from] TopicError),
    /// A service operation failed
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    /// The master could not be reached
    #[error("master error: {0}")]
    Master(#[from] MasterError),
    /// A rate or timer period that is not positive and finite
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    /// A service did not become available in time
    #[error("timed out waiting for service {0}")]
    Timeout(String),
    /// The node is shutting down
    #[error("node is shutting down")]
    ShuttingDown,
}
