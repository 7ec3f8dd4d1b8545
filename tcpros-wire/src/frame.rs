//!
//! Length-prefixed message frames and service response frames.
//!

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// The largest payload a decoder accepts by default (1GB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 30;

/// Encode `payload` as a message frame
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(4 + payload.len());
    buffer.put_u32_le(payload.len() as u32);
    buffer.put_slice(payload);
    buffer.freeze()
}

/// A decoded service response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseFrame {
    /// The service succeeded, carrying the serialized response
    Success(Bytes),
    /// The service failed, carrying the error text
    Failure(String),
}

impl ResponseFrame {
    /// Encode the response as `ok:u8 len:u32 payload`
    pub fn encode(&self) -> Bytes {
        let (ok, payload) = match self {
            ResponseFrame::Success(payload) => (1u8, &payload[..]),
            ResponseFrame::Failure(error) => (0u8, error.as_bytes()),
        };
        let mut buffer = BytesMut::with_capacity(5 + payload.len());
        buffer.put_u8(ok);
        buffer.put_u32_le(payload.len() as u32);
        buffer.put_slice(payload);
        buffer.freeze()
    }
}

#[inline]
fn read_u32(data: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameState {
    Length,
    Body(usize),
}

/// A streaming decoder for message frames
#[derive(Debug)]
pub struct FrameDecoder {
    state: FrameState,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new FrameDecoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a new FrameDecoder rejecting frames longer than `max_len`
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: FrameState::Length,
            max_len,
        }
    }

    /// Decode at most one frame from the front of `data`.
    ///
    /// Returns the number of bytes consumed and the payload if a frame was
    /// completed.  A return of `(0, None)` means more data is needed.
    pub fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<Bytes>), WireError> {
        let mut consumed = 0;
        if self.state == FrameState::Length {
            let Some(len) = read_u32(data) else {
                return Ok((0, None));
            };
            if len > self.max_len {
                return Err(WireError::FrameTooLarge {
                    len,
                    max: self.max_len,
                });
            }
            consumed = 4;
            self.state = FrameState::Body(len);
        }

        let FrameState::Body(len) = self.state else {
            return Ok((consumed, None));
        };
        let available = &data[consumed..];
        if available.len() < len {
            return Ok((consumed, None));
        }
        self.state = FrameState::Length;
        Ok((consumed + len, Some(Bytes::copy_from_slice(&available[..len]))))
    }

    /// Decode every complete frame in `data`, returning the bytes consumed
    pub fn decode_all(
        &mut self,
        data: &[u8],
        mut on_frame: impl FnMut(Bytes),
    ) -> Result<usize, WireError> {
        let mut consumed = 0;
        loop {
            let (used, frame) = self.decode(&data[consumed..])?;
            consumed += used;
            match frame {
                Some(frame) => on_frame(frame),
                None => break,
            }
        }
        Ok(consumed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ResponseState {
    OkByte,
    Length { ok: bool },
    Body { ok: bool, len: usize },
}

/// A streaming decoder for service response frames
#[derive(Debug)]
pub struct ResponseDecoder {
    state: ResponseState,
    max_len: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    /// Create a new ResponseDecoder with the default size limit
    pub fn new() -> Self {
        Self {
            state: ResponseState::OkByte,
            max_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Decode at most one response from the front of `data`.
    ///
    /// Returns the number of bytes consumed and the response if one was completed.
    pub fn decode(&mut self, data: &[u8]) -> Result<(usize, Option<ResponseFrame>), WireError> {
        let mut consumed = 0;
        loop {
            let available = &data[consumed..];
            match self.state {
                ResponseState::OkByte => {
                    let Some(&ok) = available.first() else { break };
                    let ok = match ok {
                        0 => false,
                        1 => true,
                        other => return Err(WireError::InvalidOkByte(other)),
                    };
                    consumed += 1;
                    self.state = ResponseState::Length { ok };
                }
                ResponseState::Length { ok } => {
                    let Some(len) = read_u32(available) else { break };
                    if len > self.max_len {
                        return Err(WireError::FrameTooLarge {
                            len,
                            max: self.max_len,
                        });
                    }
                    consumed += 4;
                    self.state = ResponseState::Body { ok, len };
                }
                ResponseState::Body { ok, len } => {
                    if available.len() < len {
                        break;
                    }
                    let body = &available[..len];
                    consumed += len;
                    self.state = ResponseState::OkByte;
                    let frame = if ok {
                        ResponseFrame::Success(Bytes::copy_from_slice(body))
                    } else {
                        ResponseFrame::Failure(String::from_utf8_lossy(body).into_owned())
                    };
                    return Ok((consumed, Some(frame)));
                }
            }
        }
        Ok((consumed, None))
    }
}
