//!
//! The TCPROS Wire Format
//!
//! Every TCPROS connection starts with a negotiation header exchanged in
//! both directions, after which the connection carries length-prefixed
//! frames.  All integers are little-endian `u32`s.
//!
//! ```text
//! header   := total_len:u32 field*          (fields consume exactly total_len bytes)
//! field    := field_len:u32 "key=value"
//! frame    := payload_len:u32 payload
//! response := ok:u8 payload_len:u32 payload (payload is error text when ok == 0)
//! ```
//!
//! The decoders in this crate are re-entrant state machines: they may be fed
//! any prefix of the stream and report how many bytes they consumed so the
//! caller can keep the remainder for the next read.
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub use error::WireError;

pub mod header;
pub use header::{ConnectionHeader, HeaderDecoder};

pub mod frame;
pub use frame::{encode_frame, FrameDecoder, ResponseDecoder, ResponseFrame};
