//!
//! The serving side of a service.
//!

use std::{
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, warn};

use tcpros_core::{Message, ServiceType, TypeDescriptor};
use tcpros_reactor::{ConnectionHandle, ConnectionId, Link};
use tcpros_wire::{header, ConnectionHeader, ResponseFrame};

use crate::manager::ServiceManager;

/// The text sent back when a handler panics
pub const CALLBACK_FAILED: &str = "service callback failed";

/// A type-erased handler turning a serialized request into a response frame
pub type Handler = Arc<dyn Fn(&[u8]) -> ResponseFrame + Send + Sync>;

/// Wrap a typed handler into a [`Handler`]
pub fn erase<S, F>(handler: F) -> Handler
where
    S: ServiceType,
    F: Fn(S::Request) -> Result<S::Response, String> + Send + Sync + 'static,
{
    Arc::new(move |payload: &[u8]| {
        let request = match S::Request::deserialize(payload) {
            Ok(request) => request,
            Err(err) => return ResponseFrame::Failure(format!("unable to decode request: {err}")),
        };
        match handler(request) {
            Ok(response) => {
                let mut buffer = Vec::new();
                match response.serialize(&mut buffer) {
                    Ok(()) => ResponseFrame::Success(Bytes::from(buffer)),
                    Err(err) => ResponseFrame::Failure(format!("unable to encode response: {err}")),
                }
            }
            Err(message) => ResponseFrame::Failure(message),
        }
    })
}

struct EndpointState {
    valid: bool,
    connections: Vec<ConnectionHandle>,
}

/// Every client connection and the handler of one advertised service
pub struct ServiceEndpoint {
    name: String,
    descriptor: TypeDescriptor,
    caller_id: String,
    handler: Handler,
    state: Mutex<EndpointState>,
    pending: Mutex<Vec<(ConnectionHandle, Bytes)>>,
}

impl ServiceEndpoint {
    /// Create a new ServiceEndpoint
    pub fn new(name: &str, descriptor: TypeDescriptor, caller_id: &str, handler: Handler) -> Self {
        Self {
            name: name.to_string(),
            descriptor,
            caller_id: caller_id.to_string(),
            handler,
            state: Mutex::new(EndpointState {
                valid: true,
                connections: Vec::new(),
            }),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Vec<(ConnectionHandle, Bytes)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The resolved service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service type
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Whether the endpoint has not been shut down
    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    /// The number of connected clients
    pub fn num_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// The header sent back to an accepted client
    pub fn reply_header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(header::CALLER_ID, &*self.caller_id)
            .with(header::SERVICE, &*self.name)
            .with(header::TYPE, &*self.descriptor.type_name)
            .with(header::MD5SUM, &*self.descriptor.md5sum)
    }

    /// Register a negotiated client connection.
    ///
    /// Returns false if the endpoint was shut down in the meantime.
    pub fn add_connection(&self, link: &Link<'_>) -> bool {
        let mut state = self.state();
        if state.valid {
            state.connections.push(link.handle());
        }
        state.valid
    }

    /// Forget a connection that closed
    pub fn remove_connection(&self, id: ConnectionId) {
        self.state()
            .connections
            .retain(|connection| connection.id() != id);
    }

    /// Queue a request received on `connection`.
    ///
    /// Runs on the reactor.
    pub fn enqueue(&self, connection: ConnectionHandle, request: Bytes) {
        if self.is_valid() {
            self.pending().push((connection, request));
        }
    }

    /// Run the handler on every queued request and write each response back
    /// to the connection the request came from.
    ///
    /// Returns the number of requests handled.
    pub fn invoke_callbacks(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending());
        let count = pending.len();
        for (connection, request) in pending {
            let handled = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(&request[..])));
            let response = match handled {
                Ok(response) => response,
                Err(_) => {
                    warn!(service = %self.name, "service callback panicked");
                    ResponseFrame::Failure(CALLBACK_FAILED.to_string())
                }
            };
            if let ResponseFrame::Failure(message) = &response {
                let id = connection.id();
                debug!(service = %self.name, connection = %id, "request failed: {message}");
            }
            if let Err(err) = connection.write(response.encode()) {
                let id = connection.id();
                debug!(service = %self.name, connection = %id, "dropping response: {err}");
            }
        }
        count
    }

    /// Mark the endpoint invalid and hand back its connections for closing
    pub(crate) fn invalidate(&self) -> Vec<ConnectionHandle> {
        let mut state = self.state();
        state.valid = false;
        self.pending().clear();
        std::mem::take(&mut state.connections)
    }

    /// Mark the endpoint invalid and close every connection
    pub fn shutdown(&self) {
        for connection in self.invalidate() {
            connection.close();
        }
    }
}

/// A typed handle on an advertised service
pub struct ServiceServer<S: ServiceType> {
    endpoint: Arc<ServiceEndpoint>,
    manager: ServiceManager,
    phantom: PhantomData<fn() -> S>,
}

impl<S: ServiceType> ServiceServer<S> {
    pub(crate) fn new(endpoint: Arc<ServiceEndpoint>, manager: ServiceManager) -> Self {
        Self {
            endpoint,
            manager,
            phantom: PhantomData,
        }
    }

    /// The resolved service name
    pub fn service(&self) -> &str {
        self.endpoint.name()
    }

    /// Whether the service is still advertised
    pub fn is_valid(&self) -> bool {
        self.endpoint.is_valid()
    }

    /// Close every client connection and unregister the service
    pub fn shutdown(&self) {
        self.manager.unadvertise_service(&self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Doubles a u32, failing on zero
    struct Double;

    impl ServiceType for Double {
        const TYPE: &'static str = "test_srvs/Double";
        const MD5SUM: &'static str = "4a842b65f413084dc2b10fb484ea7f17";
        type Request = u32;
        type Response = u32;
    }

    fn handler() -> Handler {
        erase::<Double, _>(|value: u32| match value {
            0 => Err("zero is not allowed".to_string()),
            13 => panic!("unlucky"),
            value => Ok(value * 2),
        })
    }

    fn request(value: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        value.serialize(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_erased_handler() {
        let handler = handler();
        assert_eq!(
            handler(&request(21)),
            ResponseFrame::Success(Bytes::from(request(42)))
        );
        assert_eq!(
            handler(&request(0)),
            ResponseFrame::Failure("zero is not allowed".into())
        );
        assert!(matches!(
            handler(&[1]),
            ResponseFrame::Failure(message) if message.starts_with("unable to decode")
        ));
    }

    #[test]
    fn test_shutdown_endpoint() {
        let endpoint = ServiceEndpoint::new("/double", Double::descriptor(), "/server", handler());
        endpoint.shutdown();
        assert!(!endpoint.is_valid());
        assert_eq!(endpoint.invoke_callbacks(), 0);
        assert_eq!(endpoint.reply_header().get(header::SERVICE), Some("/double"));
    }
}
