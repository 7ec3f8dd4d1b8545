//!
//! Errors from publishing and subscribing.
//!

use thiserror::Error;

use tcpros_core::{MasterError, MessageError};
use tcpros_reactor::ReactorError;

/// An error from a topic operation
#[derive(Debug, Error)]
pub enum TopicError {
    /// The topic (or its manager) was shut down
    #[error("topic {0} is closed")]
    TopicClosed(String),
    /// The master refused or failed a registration
    #[error("master error: {0}")]
    Master(#[from] MasterError),
    /// A message could not be serialized
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    /// The reactor could not be reached
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
}
