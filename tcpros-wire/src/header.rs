//!
//! The negotiation header exchanged at the start of every connection.
//!

use bytes::{BufMut, BytesMut};

use crate::error::WireError;

/// The name of the calling node
pub const CALLER_ID: &str = "callerid";
/// The topic a subscriber asks for
pub const TOPIC: &str = "topic";
/// The service a client asks for
pub const SERVICE: &str = "service";
/// The message or service type name
pub const TYPE: &str = "type";
/// The message or service fingerprint
pub const MD5SUM: &str = "md5sum";
/// Whether the subscriber asks for Nagle's algorithm to be disabled
pub const TCP_NODELAY: &str = "tcp_nodelay";
/// Whether the publisher latches its last message
pub const LATCHING: &str = "latching";
/// Whether the service client keeps the connection open between calls
pub const PERSISTENT: &str = "persistent";
/// A description of why the peer rejected the connection
pub const ERROR: &str = "error";
/// The full text of the message definition
pub const MESSAGE_DEFINITION: &str = "message_definition";

/// An ordered mapping from field name to value without duplicate keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionHeader {
    fields: Vec<(String, String)>,
}

impl ConnectionHeader {
    /// Create an empty header
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`ConnectionHeader::insert`]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Create a header carrying only an `error` field
    pub fn error(message: impl Into<String>) -> Self {
        Self::new().with(ERROR, message)
    }

    /// Set `key` to `value`, replacing any previous value in place
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the header carries `key`
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Whether `key` is present and set to a truthy `1`
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true"))
    }

    /// Iterate over the fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of fields in the header
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the header has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode the header into its length-prefixed wire form
    pub fn encode(&self) -> BytesMut {
        let total: usize = self
            .fields
            .iter()
            .map(|(k, v)| 4 + k.len() + 1 + v.len())
            .sum();

        let mut buffer = BytesMut::with_capacity(4 + total);
        buffer.put_u32_le(total as u32);
        for (key, value) in self.fields.iter() {
            buffer.put_u32_le((key.len() + 1 + value.len()) as u32);
            buffer.put_slice(key.as_bytes());
            buffer.put_u8(b'=');
            buffer.put_slice(value.as_bytes());
        }
        buffer
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for ConnectionHeader {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut header = ConnectionHeader::new();
        for (key, value) in iter {
            header.insert(key.as_ref(), value);
        }
        header
    }
}

/// The state of a [`HeaderDecoder`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    ReadingTotalLen,
    ReadingFieldLen,
    ReadingFieldBody(usize),
    Done,
}

/// A streaming decoder for a [`ConnectionHeader`].
///
/// Fields are only handed out once the whole header has been read, so a
/// header that turns out to be malformed never leaks partial content.
#[derive(Debug)]
pub struct HeaderDecoder {
    state: State,
    total_len: usize,
    read_len: usize,
    header: ConnectionHeader,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderDecoder {
    /// Create a new decoder waiting for the header length
    pub fn new() -> Self {
        Self {
            state: State::ReadingTotalLen,
            total_len: 0,
            read_len: 0,
            header: ConnectionHeader::new(),
        }
    }

    /// Whether a complete header has been read
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Take the decoded header once [`HeaderDecoder::is_done`] reports true
    pub fn take_header(&mut self) -> Option<ConnectionHeader> {
        if self.is_done() {
            Some(std::mem::take(&mut self.header))
        } else {
            None
        }
    }

    /// Consume as much of `data` as possible, returning the number of bytes used.
    ///
    /// Bytes past the end of the header are never consumed.
    pub fn decode(&mut self, data: &[u8]) -> Result<usize, WireError> {
        let mut consumed = 0;
        loop {
            let available = &data[consumed..];
            match self.state {
                State::Done => break,
                State::ReadingTotalLen => {
                    let Some(len) = read_u32(available) else { break };
                    consumed += 4;
                    self.total_len = len;
                    self.state = if len == 0 {
                        State::Done
                    } else {
                        State::ReadingFieldLen
                    };
                }
                State::ReadingFieldLen => {
                    let Some(len) = read_u32(available) else { break };
                    let remaining = self.total_len - self.read_len;
                    if 4 + len > remaining {
                        return Err(WireError::FieldOverrun {
                            field_len: 4 + len,
                            remaining,
                        });
                    }
                    consumed += 4;
                    self.read_len += 4;
                    self.state = State::ReadingFieldBody(len);
                }
                State::ReadingFieldBody(len) => {
                    if available.len() < len {
                        break;
                    }
                    let (key, value) = split_field(&available[..len])?;
                    self.header.insert(&key, value);
                    consumed += len;
                    self.read_len += len;
                    self.state = if self.read_len == self.total_len {
                        State::Done
                    } else {
                        State::ReadingFieldLen
                    };
                }
            }
        }
        Ok(consumed)
    }
}

#[inline]
fn read_u32(data: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

/// Split `key=value` on the first `=` only
fn split_field(field: &[u8]) -> Result<(String, String), WireError> {
    let text = std::str::from_utf8(field)
        .map_err(|_| WireError::MalformedField(String::from_utf8_lossy(field).into_owned()))?;
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| WireError::MalformedField(text.to_string()))?;
    if key.is_empty() {
        return Err(WireError::MalformedField(text.to_string()));
    }
    Ok((key.to_string(), value.to_string()))
}
