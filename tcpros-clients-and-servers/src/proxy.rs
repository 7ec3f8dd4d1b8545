//!
//! The calling side of a service.
//!
//! A [`ServiceProxy`] is a monitor: the calling thread holds the proxy's
//! lock while it writes a request and then sleeps on a condition variable,
//! releasing the lock so the reactor can deliver the response.  The reactor
//! only ever stores the raw response; decoding happens on the caller.
//!

use std::{
    marker::PhantomData,
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use tracing::debug;

use tcpros_core::{Message, ServiceType};
use tcpros_reactor::{ConnectionHandle, ConnectionId, ReactorHandle};
use tcpros_wire::{encode_frame, header, ConnectionHeader, ResponseFrame};

use crate::{error::CallError, tcp::ServiceOutbound};

/// The lifecycle of a service proxy's connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// Connecting or negotiating
    Created,
    /// Negotiated and idle
    Ready,
    /// A request was written and the caller waits for the response
    WaitResponse,
    /// A response arrived and the caller has not collected it yet
    Completed,
    /// The connection failed and the caller has not collected the error yet
    Failed,
    /// The connection is gone
    Closed,
    /// A single-use connection finished its call
    Retired,
}

struct Slot {
    state: ProxyState,
    connection: Option<ConnectionHandle>,
    response: Option<ResponseFrame>,
    error: Option<CallError>,
    /// Set once the owning manager shut down
    terminated: bool,
}

/// The state shared between a proxy's callers and its connection on the reactor.
///
/// Every notification carries the id of the connection it came from, and
/// notifications from anything but the current connection are ignored.
pub struct ProxyMonitor {
    slot: Mutex<Slot>,
    signal: Condvar,
}

impl ProxyMonitor {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: ProxyState::Closed,
                connection: None,
                response: None,
                error: None,
                terminated: false,
            }),
            signal: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, slot: MutexGuard<'a, Slot>) -> MutexGuard<'a, Slot> {
        self.signal
            .wait(slot)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn current<'a>(&'a self, id: ConnectionId) -> Option<MutexGuard<'a, Slot>> {
        let slot = self.lock();
        let current = slot
            .connection
            .as_ref()
            .is_some_and(|connection| connection.id() == id);
        current.then_some(slot)
    }

    /// Negotiation on connection `id` succeeded
    pub fn ready(&self, id: ConnectionId) {
        if let Some(mut slot) = self.current(id) {
            if slot.state == ProxyState::Created {
                slot.state = ProxyState::Ready;
                self.signal.notify_all();
            }
        }
    }

    /// Connection `id` failed with `error`
    pub fn fail(&self, id: ConnectionId, error: CallError) {
        if let Some(mut slot) = self.current(id) {
            if matches!(
                slot.state,
                ProxyState::Created | ProxyState::Ready | ProxyState::WaitResponse
            ) {
                slot.state = ProxyState::Failed;
                slot.error = Some(error);
                self.signal.notify_all();
            }
        }
    }

    /// A response arrived on connection `id`
    pub fn complete(&self, id: ConnectionId, response: ResponseFrame) {
        if let Some(mut slot) = self.current(id) {
            if slot.state == ProxyState::WaitResponse {
                slot.state = ProxyState::Completed;
                slot.response = Some(response);
                self.signal.notify_all();
            } else {
                debug!(connection = %id, "dropping unexpected service response");
            }
        }
    }

    /// Connection `id` closed.
    ///
    /// A waiting caller is woken with [`CallError::ConnectionClosed`]; an
    /// idle proxy only records that the connection is gone.
    pub fn closed(&self, id: ConnectionId) {
        if let Some(mut slot) = self.current(id) {
            slot.connection = None;
            match slot.state {
                ProxyState::Created | ProxyState::WaitResponse => {
                    slot.state = ProxyState::Failed;
                    slot.error = Some(CallError::ConnectionClosed);
                }
                ProxyState::Ready => slot.state = ProxyState::Closed,
                _ => {}
            }
            self.signal.notify_all();
        }
    }

    /// Close the connection for good, waking any waiting caller
    pub fn terminate(&self) {
        let mut slot = self.lock();
        slot.terminated = true;
        if let Some(connection) = slot.connection.take() {
            connection.close();
        }
        if matches!(slot.state, ProxyState::Created | ProxyState::WaitResponse) {
            slot.state = ProxyState::Failed;
            slot.error = Some(CallError::ConnectionClosed);
        } else if slot.state != ProxyState::Failed {
            slot.state = ProxyState::Closed;
        }
        self.signal.notify_all();
    }
}

/// Finds the address of the service provider
pub type Lookup = Arc<dyn Fn() -> Result<SocketAddr, CallError> + Send + Sync>;

/// A blocking, typed client for one service
pub struct ServiceProxy<S: ServiceType> {
    service: String,
    caller_id: String,
    persistent: bool,
    reactor: ReactorHandle,
    lookup: Lookup,
    monitor: Arc<ProxyMonitor>,
    phantom: PhantomData<fn() -> S>,
}

impl<S: ServiceType> ServiceProxy<S> {
    /// Create a proxy for `service` and start connecting to it.
    ///
    /// `lookup` is consulted for the provider's address now and again every
    /// time a single-use proxy reconnects.
    pub fn new(
        service: &str,
        caller_id: &str,
        persistent: bool,
        reactor: ReactorHandle,
        lookup: Lookup,
    ) -> Result<Self, CallError> {
        let proxy = Self {
            service: service.to_string(),
            caller_id: caller_id.to_string(),
            persistent,
            reactor,
            lookup,
            monitor: Arc::new(ProxyMonitor::new()),
            phantom: PhantomData,
        };
        proxy.connect()?;
        Ok(proxy)
    }

    /// A weak reference to the monitor shared with the proxy's connection
    pub(crate) fn downgrade(&self) -> Weak<ProxyMonitor> {
        Arc::downgrade(&self.monitor)
    }

    /// The resolved service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Whether the proxy keeps its connection between calls
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The current state of the proxy
    pub fn state(&self) -> ProxyState {
        self.monitor.lock().state
    }

    /// Whether a call may still succeed, possibly after reconnecting
    pub fn is_valid(&self) -> bool {
        if self.monitor.lock().terminated {
            return false;
        }
        match self.state() {
            ProxyState::Created | ProxyState::Ready => true,
            ProxyState::Retired | ProxyState::Closed => !self.persistent,
            _ => false,
        }
    }

    /// The header sent to the service provider when connecting
    pub fn request_header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(header::CALLER_ID, &*self.caller_id)
            .with(header::SERVICE, &*self.service)
            .with(header::TYPE, S::TYPE)
            .with(header::MD5SUM, S::MD5SUM)
            .with(header::PERSISTENT, if self.persistent { "1" } else { "0" })
    }

    fn connect(&self) -> Result<(), CallError> {
        let addr = (self.lookup)()?;
        let role = ServiceOutbound::new(
            self.service.clone(),
            S::descriptor(),
            self.request_header(),
            self.monitor.clone(),
        );

        // connect while holding the lock so the reactor can not report on the
        // new connection before it is recorded as current
        let mut slot = self.monitor.lock();
        if slot.terminated {
            return Err(CallError::NotReady);
        }
        let connection = self.reactor.connect(addr, Box::new(role))?;
        let id = connection.id();
        debug!(service = %self.service, connection = %id, %addr, "connecting to service");
        slot.state = ProxyState::Created;
        slot.connection = Some(connection);
        slot.response = None;
        slot.error = None;
        Ok(())
    }

    /// Block until negotiation finished or `timeout` elapsed.
    ///
    /// Returns whether the proxy is ready.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.monitor.lock();
        while slot.state == ProxyState::Created {
            slot = match deadline {
                None => self.monitor.wait(slot),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.monitor
                        .signal
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        slot.state == ProxyState::Ready
    }

    /// Send `request` and block until the response arrives.
    ///
    /// A single-use proxy reconnects first if its previous connection was
    /// retired or lost.
    pub fn call(&self, request: &S::Request) -> Result<S::Response, CallError> {
        let mut payload = Vec::new();
        request.serialize(&mut payload)?;

        let reconnect = !self.persistent
            && matches!(self.state(), ProxyState::Retired | ProxyState::Closed);
        if reconnect {
            self.connect()?;
        }

        let mut slot = self.monitor.lock();
        while slot.state == ProxyState::Created {
            slot = self.monitor.wait(slot);
        }

        match slot.state {
            ProxyState::Ready => {}
            ProxyState::WaitResponse | ProxyState::Completed => return Err(CallError::Busy),
            ProxyState::Failed => {
                slot.state = ProxyState::Closed;
                return Err(slot.error.take().unwrap_or(CallError::ConnectionClosed));
            }
            ProxyState::Closed => return Err(CallError::ConnectionClosed),
            ProxyState::Retired | ProxyState::Created => return Err(CallError::NotReady),
        }

        let Some(connection) = slot.connection.clone() else {
            slot.state = ProxyState::Closed;
            return Err(CallError::ConnectionClosed);
        };
        if connection.write(encode_frame(&payload)).is_err() {
            slot.state = ProxyState::Closed;
            return Err(CallError::ConnectionClosed);
        }
        slot.state = ProxyState::WaitResponse;
        while slot.state == ProxyState::WaitResponse {
            slot = self.monitor.wait(slot);
        }

        let response = match slot.state {
            ProxyState::Completed => slot.response.take(),
            _ => {
                slot.state = ProxyState::Closed;
                return Err(slot.error.take().unwrap_or(CallError::ConnectionClosed));
            }
        };

        if self.persistent {
            slot.state = ProxyState::Ready;
        } else {
            slot.state = ProxyState::Retired;
            if let Some(connection) = slot.connection.take() {
                connection.close();
            }
        }
        drop(slot);

        match response {
            Some(ResponseFrame::Success(payload)) => Ok(S::Response::deserialize(&payload)?),
            Some(ResponseFrame::Failure(message)) => Err(CallError::Remote(message)),
            None => Err(CallError::ConnectionClosed),
        }
    }

    /// Close the connection; later calls on a persistent proxy fail
    pub fn close(&self) {
        let mut slot = self.monitor.lock();
        if let Some(connection) = slot.connection.take() {
            connection.close();
        }
        if slot.state != ProxyState::Failed {
            slot.state = ProxyState::Closed;
        }
        self.monitor.signal.notify_all();
    }
}

impl<S: ServiceType> Drop for ServiceProxy<S> {
    fn drop(&mut self) {
        if let Some(connection) = self.monitor.lock().connection.take() {
            connection.close();
        }
    }
}

impl<S: ServiceType> tcpros_core::Client for ServiceProxy<S> {
    type Request = S::Request;
    type Response = S::Response;
    type Error = CallError;

    fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error> {
        ServiceProxy::call(self, request)
    }
}
