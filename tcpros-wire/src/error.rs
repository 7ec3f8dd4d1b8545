//!
//! Protocol violations detected while decoding the wire format.
//!

use thiserror::Error;

/// A violation of the TCPROS framing rules.
///
/// Any of these terminates the connection it was found on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WireError {
    /// A header field claims more bytes than remain in the declared header length
    #[error("header field of {field_len} bytes overruns the {remaining} bytes left in the header")]
    FieldOverrun {
        /// The length the field claimed (including its length prefix)
        field_len: usize,
        /// The bytes left in the header when the field was read
        remaining: usize,
    },
    /// A header field is not of the form `key=value`
    #[error("malformed header field {0:?}")]
    MalformedField(String),
    /// A frame announced a payload larger than the decoder accepts
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// The announced payload length
        len: usize,
        /// The configured limit
        max: usize,
    },
    /// A service response started with something other than 0 or 1
    #[error("invalid ok byte {0} in service response")]
    InvalidOkByte(u8),
}
