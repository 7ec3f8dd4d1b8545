//!
//! Errors from talking to the reactor.
//!

use std::io;

use thiserror::Error;

/// An error from scheduling work on the reactor
#[derive(Debug, Error)]
pub enum ReactorError {
    /// std::io::Error while binding or configuring a socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The reactor thread has stopped and no longer accepts commands
    #[error("reactor stopped")]
    Stopped,
}
