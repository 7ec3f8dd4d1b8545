//!
//! Errors shared by every TCPROS crate.
//!

use thiserror::Error;

/// An error from serializing a message into a buffer or from
/// deserializing a message out of a slice.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MessageError {
    /// The slice ended before the message was fully read.
    #[error("buffer too short: needed {needed} bytes, {available} available")]
    InvalidBufferSize {
        /// The number of bytes the decoder needed
        needed: usize,
        /// The number of bytes that were left
        available: usize,
    },
    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    /// Any other schema level failure reported by generated code.
    #[error("invalid message: {0}")]
    Invalid(String),
}

/// A failure reported by (or while talking to) the discovery authority
/// or a peer node's RPC surface.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MasterError {
    /// The remote side answered with a status code other than 1.
    #[error("code={code}, message={message}")]
    Status {
        /// The status code returned by the remote method
        code: i32,
        /// The human readable status message
        message: String,
    },
    /// The RPC transport could not deliver the call.
    #[error("rpc transport failed: {0}")]
    Transport(String),
    /// The call succeeded but its value did not have the expected shape.
    #[error("unexpected value returned from {method}")]
    UnexpectedValue {
        /// The remote method whose return value was malformed
        method: &'static str,
    },
    /// A URI returned by the master could not be parsed into a host and port.
    #[error("invalid uri {0:?}")]
    InvalidUri(String),
}
