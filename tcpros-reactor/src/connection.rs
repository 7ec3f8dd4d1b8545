//!
//! A single TCP session owned by the reactor.
//!
//! An outbound connection first waits for its non-blocking connect to
//! finish.  Every connection then reads the peer's negotiation header, and
//! only once the header is complete (and the connection's [`Protocol`]
//! accepted it) does the connection start handing raw bytes to the protocol
//! for frame decoding.
//!

use std::{
    fmt,
    hash::{Hash, Hasher},
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr},
};

use bytes::{Buf, Bytes, BytesMut};
use mio::{net::TcpStream, Registry, Token};
use tracing::{debug, warn};

use tcpros_wire::{ConnectionHeader, HeaderDecoder, WireError};

use crate::{
    error::ReactorError,
    reactor::{Command, Mailbox},
};

/// The size of the scratch buffer used for every socket read
const READ_CHUNK: usize = 64 * 1024;

/// A unique identifier for a connection within one reactor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The lifecycle of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// An outbound connect that has not completed yet
    Connecting,
    /// Waiting for (or validating) the peer's header
    Negotiating,
    /// Negotiation succeeded and frames are flowing
    Established,
    /// The connection is flushing its last writes before closing
    Closing,
}

/// A cheap, cloneable reference to a connection usable from any thread.
///
/// Every method only enqueues a command for the reactor and wakes it, so it
/// never blocks and never touches the socket directly.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    mailbox: Mailbox,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, mailbox: Mailbox) -> Self {
        Self { id, mailbox }
    }

    /// The identifier of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `data` to be written to the connection
    pub fn write(&self, data: Bytes) -> Result<(), ReactorError> {
        self.mailbox.send(Command::Write { id: self.id, data })
    }

    /// Close the connection on the reactor, dropping unsent data
    pub fn close(&self) {
        let _ = self.mailbox.send(Command::Close {
            id: self.id,
            flush: false,
        });
    }

    /// Close the connection once everything queued so far has been written
    pub fn close_after_writing(&self) {
        let _ = self.mailbox.send(Command::Close {
            id: self.id,
            flush: true,
        });
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionHandle").field(&self.id).finish()
    }
}

/// How a connection was asked to close
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseMode {
    Now,
    AfterWriting,
}

/// The reactor-side view of a connection handed to a [`Protocol`].
///
/// Writes made through a link are appended directly to the connection's
/// outbound buffer, ahead of anything still sitting in the command queue.
pub struct Link<'a> {
    state: ConnectionState,
    handle: &'a ConnectionHandle,
    stream: &'a TcpStream,
    outbound: &'a mut BytesMut,
    close: &'a mut Option<CloseMode>,
}

impl<'a> Link<'a> {
    /// The identifier of this connection
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// The state of the connection
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A handle to this connection that can outlive the callback
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// The address of the remote end
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Enable or disable Nagle's algorithm on the socket
    pub fn set_nodelay(&self, nodelay: bool) {
        if let Err(err) = self.stream.set_nodelay(nodelay) {
            debug!(connection = %self.handle.id, "unable to set tcp_nodelay: {err}");
        }
    }

    /// Append `data` to the outbound buffer
    pub fn write(&mut self, data: &[u8]) {
        if self.close.is_none() {
            self.outbound.extend_from_slice(data);
        }
    }

    /// Encode and send a negotiation header
    pub fn write_header(&mut self, header: &ConnectionHeader) {
        let encoded = header.encode();
        self.write(&encoded);
    }

    /// Send a header carrying only `error` and close once it is flushed
    pub fn reject(&mut self, error: &str) {
        let peer = self.peer_addr();
        warn!(connection = %self.handle.id, ?peer, "rejecting connection: {error}");
        self.write_header(&ConnectionHeader::error(error));
        self.close_after_writing();
    }

    /// Close immediately, dropping anything unsent
    pub fn close(&mut self) {
        *self.close = Some(CloseMode::Now);
    }

    /// Close once the outbound buffer has been flushed
    pub fn close_after_writing(&mut self) {
        if self.close.is_none() {
            *self.close = Some(CloseMode::AfterWriting);
        }
    }
}

/// The per-role behaviour of a connection.
///
/// All methods are invoked on the reactor thread and must never block or
/// run user code.
pub trait Protocol: Send + 'static {
    /// The socket is connected (outbound) or accepted (inbound).
    ///
    /// Outbound roles send their request header here.
    fn on_open(&mut self, _link: &mut Link<'_>) {}

    /// The peer's negotiation header was fully decoded.
    ///
    /// Implementations validate the header and either register the
    /// connection with its owner or reject it through the link.
    fn on_header(&mut self, header: ConnectionHeader, link: &mut Link<'_>);

    /// Bytes arrived after a successful negotiation.
    ///
    /// Returns the number of bytes consumed; the remainder is offered again
    /// once more data arrives.
    fn on_data(&mut self, data: &[u8], link: &mut Link<'_>) -> Result<usize, WireError>;

    /// Connection `id` is gone.  It was closed by either end, or it could
    /// never be established.
    ///
    /// For a failed outbound connect this is the only callback the protocol
    /// receives, so `id` is the one returned by
    /// [`ReactorHandle::connect`](crate::ReactorHandle::connect).
    fn on_close(&mut self, _id: ConnectionId) {}
}

/// What happened when a connection was serviced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Poll {
    Open,
    Closed,
}

/// A connection as owned by the reactor
pub(crate) struct Connection {
    pub(crate) handle: ConnectionHandle,
    stream: TcpStream,
    protocol: Box<dyn Protocol>,
    state: ConnectionState,
    decoder: HeaderDecoder,
    inbound: BytesMut,
    outbound: BytesMut,
    close: Option<CloseMode>,
    peer_closed: bool,
}

impl Connection {
    /// Wrap an accepted `stream`
    pub(crate) fn inbound(
        handle: ConnectionHandle,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
    ) -> Self {
        Self::new(handle, stream, protocol, ConnectionState::Negotiating)
    }

    /// Wrap a `stream` whose connect is still in progress
    pub(crate) fn outbound(
        handle: ConnectionHandle,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
    ) -> Self {
        Self::new(handle, stream, protocol, ConnectionState::Connecting)
    }

    fn new(
        handle: ConnectionHandle,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
        state: ConnectionState,
    ) -> Self {
        Self {
            handle,
            stream,
            protocol,
            state,
            decoder: HeaderDecoder::new(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            close: None,
            peer_closed: false,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.handle.id
    }

    fn link(&mut self) -> (Link<'_>, &mut Box<dyn Protocol>) {
        (
            Link {
                state: self.state,
                handle: &self.handle,
                stream: &self.stream,
                outbound: &mut self.outbound,
                close: &mut self.close,
            },
            &mut self.protocol,
        )
    }

    pub(crate) fn open(&mut self) {
        let (mut link, protocol) = self.link();
        protocol.on_open(&mut link);
    }

    pub(crate) fn queue(&mut self, data: &[u8]) {
        if self.close.is_none() {
            self.outbound.extend_from_slice(data);
        }
    }

    pub(crate) fn request_close(&mut self, flush: bool) {
        if flush {
            if self.close.is_none() {
                self.close = Some(CloseMode::AfterWriting);
            }
        } else {
            self.close = Some(CloseMode::Now);
        }
    }

    /// Whether a pending connect finished, failing if it was refused
    fn connected(&self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Read, decode and flush as far as the socket allows without blocking.
    ///
    /// Called whenever the socket reported readiness or a command touched
    /// the connection.  The socket is edge triggered, so reads and writes
    /// continue until they would block.
    pub(crate) fn poll(&mut self) -> Poll {
        if self.state == ConnectionState::Connecting {
            if self.close == Some(CloseMode::Now) {
                debug!(connection = %self.id(), "closed before the connect completed");
                return Poll::Closed;
            }
            match self.connected() {
                Ok(true) => {
                    let peer = self.stream.peer_addr().ok();
                    debug!(connection = %self.id(), ?peer, "connected");
                    self.state = ConnectionState::Negotiating;
                    // writes queued while connecting follow whatever on_open sends
                    let queued = self.outbound.split();
                    self.open();
                    self.outbound.unsplit(queued);
                }
                Ok(false) => return Poll::Open,
                Err(err) => {
                    debug!(connection = %self.id(), "connect failed: {err}");
                    return Poll::Closed;
                }
            }
        }

        if self.close.is_none() && !self.peer_closed {
            self.read();
        }

        if let Err(err) = self.process() {
            warn!(connection = %self.id(), "protocol violation: {err}");
            self.close = Some(CloseMode::Now);
        }

        if self.close.is_some() {
            self.state = ConnectionState::Closing;
        }

        match self.close {
            Some(CloseMode::Now) => return Poll::Closed,
            _ => self.flush(),
        }

        match self.close {
            Some(CloseMode::Now) => Poll::Closed,
            Some(CloseMode::AfterWriting) if self.outbound.is_empty() => Poll::Closed,
            _ if self.peer_closed => Poll::Closed,
            _ => Poll::Open,
        }
    }

    fn read(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(connection = %self.id(), "peer closed the connection");
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(connection = %self.id(), "read failed: {err}");
                    self.peer_closed = true;
                    break;
                }
            }
        }
    }

    /// Drive the header decoder and then the protocol until no more progress is made
    fn process(&mut self) -> Result<(), WireError> {
        loop {
            if self.close.is_some() || self.inbound.is_empty() {
                return Ok(());
            }

            match self.state {
                ConnectionState::Negotiating => {
                    let consumed = self.decoder.decode(&self.inbound)?;
                    self.inbound.advance(consumed);
                    let Some(header) = self.decoder.take_header() else {
                        return Ok(());
                    };
                    debug!(connection = %self.id(), ?header, "received header");
                    self.state = ConnectionState::Established;
                    let (mut link, protocol) = self.link();
                    protocol.on_header(header, &mut link);
                }
                ConnectionState::Established => {
                    let inbound = self.inbound.split().freeze();
                    let (mut link, protocol) = self.link();
                    let consumed = protocol.on_data(&inbound, &mut link)?;
                    if consumed < inbound.len() {
                        self.inbound = BytesMut::from(&inbound[consumed..]);
                    }
                    if consumed == 0 {
                        return Ok(());
                    }
                }
                ConnectionState::Connecting | ConnectionState::Closing => return Ok(()),
            }
        }
    }

    fn flush(&mut self) {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.close = Some(CloseMode::Now);
                    break;
                }
                Ok(n) => self.outbound.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(connection = %self.id(), "write failed: {err}");
                    self.close = Some(CloseMode::Now);
                    break;
                }
            }
        }
    }

    /// Deregister and shut the socket down, then notify the protocol
    pub(crate) fn finish(mut self, registry: &Registry) {
        if let Err(err) = registry.deregister(&mut self.stream) {
            debug!(connection = %self.id(), "unable to deregister socket: {err}");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        let id = self.id();
        self.protocol.on_close(id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    /// A protocol recording every event it receives
    #[derive(Default)]
    pub(crate) struct Recording {
        pub opened: bool,
        pub headers: Vec<ConnectionHeader>,
        pub data: Vec<u8>,
        pub closed: Vec<ConnectionId>,
    }

    pub(crate) struct Recorder {
        pub events: Arc<Mutex<Recording>>,
        pub greeting: Option<ConnectionHeader>,
        pub reject: Option<String>,
    }

    impl Protocol for Recorder {
        fn on_open(&mut self, link: &mut Link<'_>) {
            self.events.lock().unwrap().opened = true;
            if let Some(greeting) = self.greeting.as_ref() {
                link.write_header(greeting);
            }
        }

        fn on_header(&mut self, header: ConnectionHeader, link: &mut Link<'_>) {
            self.events.lock().unwrap().headers.push(header);
            if let Some(reason) = self.reject.as_ref() {
                link.reject(reason);
            }
        }

        fn on_data(&mut self, data: &[u8], _link: &mut Link<'_>) -> Result<usize, WireError> {
            self.events.lock().unwrap().data.extend_from_slice(data);
            Ok(data.len())
        }

        fn on_close(&mut self, id: ConnectionId) {
            self.events.lock().unwrap().closed.push(id);
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }

    #[test]
    fn test_connection_id_token() {
        let id = ConnectionId(42);
        assert_eq!(id.token(), Token(42));
        assert_eq!(ConnectionId::from(id.token()), id);
    }
}
