//!
//! Errors from serving and calling services.
//!

use thiserror::Error;

use tcpros_core::{MasterError, MessageError};
use tcpros_reactor::ReactorError;

/// An error from advertising a service or creating a proxy
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service (or its manager) was shut down
    #[error("service {0} is closed")]
    ServiceClosed(String),
    /// The master refused or failed a registration or lookup
    #[error("master error: {0}")]
    Master(#[from] MasterError),
    /// The reactor could not be reached
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

/// An error from a single service call
#[derive(Debug, Error)]
pub enum CallError {
    /// The proxy has no usable connection
    #[error("service proxy is not ready")]
    NotReady,
    /// Another call is already waiting on this proxy
    #[error("service proxy is busy with another call")]
    Busy,
    /// The connection was lost before a response arrived
    #[error("connection closed")]
    ConnectionClosed,
    /// The server refused the connection
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// The server answered with a failure
    #[error("service call failed: {0}")]
    Remote(String),
    /// The request or response could not be (de)serialized
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// The service could not be looked up again
    #[error("master error: {0}")]
    Master(#[from] MasterError),
    /// The reactor could not be reached
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
}
