//!
//! The reactor thread and the handles used to schedule work on it.
//!
//! The reactor blocks on socket readiness.  Commands from other threads are
//! queued on a channel and a [`Waker`] interrupts the poll so they are
//! applied promptly.
//!

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{self, SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token, Waker,
};
use tracing::{debug, error, info};

use crate::{
    connection::{Connection, ConnectionHandle, ConnectionId, Poll as Progress, Protocol},
    error::ReactorError,
};

/// Token of the waker, listener and connection ids start at 1
const WAKER: Token = Token(0);

const EVENT_CAPACITY: usize = 256;

/// Builds the protocol for every connection a listener accepts
pub type ProtocolFactory = Arc<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;

/// Work scheduled on the reactor from other threads
pub(crate) enum Command {
    Listen {
        id: u64,
        listener: TcpListener,
        factory: ProtocolFactory,
    },
    StopListener(u64),
    Connect {
        id: ConnectionId,
        addr: SocketAddr,
        protocol: Box<dyn Protocol>,
    },
    Write {
        id: ConnectionId,
        data: Bytes,
    },
    Close {
        id: ConnectionId,
        flush: bool,
    },
    Shutdown,
}

/// The sending half of the reactor's command queue
#[derive(Clone)]
pub(crate) struct Mailbox {
    commands: Sender<Command>,
    waker: Arc<Waker>,
}

impl Mailbox {
    /// Queue `command` and wake the reactor
    pub(crate) fn send(&self, command: Command) -> Result<(), ReactorError> {
        self.commands.send(command).map_err(|_| ReactorError::Stopped)?;
        if let Err(err) = self.waker.wake() {
            debug!("unable to wake the reactor: {err}");
        }
        Ok(())
    }
}

/// A listening socket running on the reactor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerHandle {
    id: u64,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    /// The address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The port the listener is bound to
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// A cloneable handle used to open listeners and connections on the reactor
#[derive(Clone)]
pub struct ReactorHandle {
    mailbox: Mailbox,
    next_id: Arc<AtomicU64>,
}

impl ReactorHandle {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind `addr` and accept connections on it, building each connection's
    /// protocol with `factory`.
    ///
    /// Binding happens on the calling thread so address errors are reported
    /// immediately.
    pub fn listen<A, F>(&self, addr: A, factory: F) -> Result<ListenerHandle, ReactorError>
    where
        A: ToSocketAddrs,
        F: Fn() -> Box<dyn Protocol> + Send + Sync + 'static,
    {
        let listener = net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let id = self.next_id();
        self.mailbox.send(Command::Listen {
            id,
            listener: TcpListener::from_std(listener),
            factory: Arc::new(factory),
        })?;
        Ok(ListenerHandle { id, local_addr })
    }

    /// Stop accepting connections on `listener`.
    ///
    /// Connections already accepted stay open.
    pub fn stop_listener(&self, listener: &ListenerHandle) {
        let _ = self.mailbox.send(Command::StopListener(listener.id));
    }

    /// Open an outbound connection to `addr` driven by `protocol`.
    ///
    /// The handle is returned immediately and the connect itself runs on the
    /// reactor without blocking it.  If the connection can not be established
    /// the protocol's `on_close` runs on the reactor with the returned
    /// handle's id.  When this returns an error the protocol is dropped
    /// without any callback.
    pub fn connect(
        &self,
        addr: SocketAddr,
        protocol: Box<dyn Protocol>,
    ) -> Result<ConnectionHandle, ReactorError> {
        let id = ConnectionId(self.next_id());
        self.mailbox.send(Command::Connect { id, addr, protocol })?;
        Ok(ConnectionHandle::new(id, self.mailbox.clone()))
    }
}

/// The reactor: one thread owning every socket of a node.
///
/// Dropping the reactor closes every connection and listener and joins the
/// thread.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Spawn a reactor thread
    pub fn spawn() -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (commands, receiver) = channel::unbounded();
        let handle = ReactorHandle {
            mailbox: Mailbox { commands, waker },
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let event_loop = EventLoop {
            poll,
            mailbox: handle.mailbox.clone(),
            receiver,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            next_id: handle.next_id.clone(),
        };
        let thread = thread::Builder::new()
            .name("tcpros-reactor".into())
            .spawn(move || event_loop.run())?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// A handle for scheduling work on this reactor
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Close every socket and join the reactor thread
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.mailbox.send(Command::Shutdown);
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }

    /// Whether the reactor thread is still running
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Listener {
    listener: TcpListener,
    factory: ProtocolFactory,
}

/// The state owned by the reactor thread
struct EventLoop {
    poll: Poll,
    mailbox: Mailbox,
    receiver: Receiver<Command>,
    listeners: HashMap<u64, Listener>,
    connections: HashMap<ConnectionId, Connection>,
    next_id: Arc<AtomicU64>,
}

impl EventLoop {
    fn run(mut self) {
        debug!("reactor started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut ready = Vec::new();
        'running: loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {err}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    token if self.listeners.contains_key(&(token.0 as u64)) => {
                        self.accept(token.0 as u64, &mut ready);
                    }
                    token => ready.push(ConnectionId::from(token)),
                }
            }

            while let Ok(command) = self.receiver.try_recv() {
                if !self.apply(command, &mut ready) {
                    break 'running;
                }
            }

            ready.sort_unstable();
            ready.dedup();
            for id in ready.drain(..) {
                self.service(id);
            }
        }

        let registry = self.poll.registry();
        for (_, connection) in self.connections.drain() {
            connection.finish(registry);
        }
        for (_, mut listener) in self.listeners.drain() {
            let _ = registry.deregister(&mut listener.listener);
        }
        debug!("reactor stopped");
    }

    /// Apply one command, returning false once the reactor should stop.
    ///
    /// Connections the command touched are pushed onto `ready`.
    fn apply(&mut self, command: Command, ready: &mut Vec<ConnectionId>) -> bool {
        match command {
            Command::Listen {
                id,
                mut listener,
                factory,
            } => {
                let token = Token(id as usize);
                let registry = self.poll.registry();
                match registry.register(&mut listener, token, Interest::READABLE) {
                    Ok(()) => {
                        if let Ok(addr) = listener.local_addr() {
                            info!(%addr, "listening");
                        }
                        self.listeners.insert(id, Listener { listener, factory });
                        self.accept(id, ready);
                    }
                    Err(err) => error!("unable to register listener: {err}"),
                }
            }
            Command::StopListener(id) => {
                if let Some(mut listener) = self.listeners.remove(&id) {
                    let _ = self.poll.registry().deregister(&mut listener.listener);
                    if let Ok(addr) = listener.listener.local_addr() {
                        info!(%addr, "stopped listening");
                    }
                }
            }
            Command::Connect {
                id,
                addr,
                mut protocol,
            } => match TcpStream::connect(addr) {
                Ok(stream) => {
                    debug!(connection = %id, peer = %addr, "connecting");
                    if self.register(id, stream, protocol, true) {
                        ready.push(id);
                    }
                }
                Err(err) => {
                    debug!(connection = %id, peer = %addr, "connect failed: {err}");
                    protocol.on_close(id);
                }
            },
            Command::Write { id, data } => match self.connections.get_mut(&id) {
                Some(connection) => {
                    connection.queue(&data);
                    ready.push(id);
                }
                None => debug!(connection = %id, "dropping write to a closed connection"),
            },
            Command::Close { id, flush } => {
                if let Some(connection) = self.connections.get_mut(&id) {
                    connection.request_close(flush);
                    ready.push(id);
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Register `stream` for readiness and start tracking it
    fn register(
        &mut self,
        id: ConnectionId,
        mut stream: TcpStream,
        mut protocol: Box<dyn Protocol>,
        outbound: bool,
    ) -> bool {
        let interest = Interest::READABLE | Interest::WRITABLE;
        if let Err(err) = self.poll.registry().register(&mut stream, id.token(), interest) {
            error!(connection = %id, "unable to register socket: {err}");
            protocol.on_close(id);
            return false;
        }

        let handle = ConnectionHandle::new(id, self.mailbox.clone());
        let connection = if outbound {
            Connection::outbound(handle, stream, protocol)
        } else {
            let mut connection = Connection::inbound(handle, stream, protocol);
            connection.open();
            connection
        };
        self.connections.insert(id, connection);
        true
    }

    /// Accept every pending connection on listener `id`
    fn accept(&mut self, id: u64, ready: &mut Vec<ConnectionId>) {
        let Some(listener) = self.listeners.get(&id) else {
            return;
        };

        let mut accepted = Vec::new();
        loop {
            match listener.listener.accept() {
                Ok((stream, peer)) => {
                    let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                    debug!(connection = %id, %peer, "accepted connection");
                    accepted.push((id, stream, (listener.factory)()));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("accept failed: {err}");
                    break;
                }
            }
        }

        for (id, stream, protocol) in accepted {
            if self.register(id, stream, protocol, false) {
                ready.push(id);
            }
        }
    }

    /// Drive connection `id` and finish it once it closed
    fn service(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if connection.poll() == Progress::Closed {
            if let Some(connection) = self.connections.remove(&id) {
                debug!(connection = %id, "connection closed");
                connection.finish(self.poll.registry());
            }
        }
    }
}
