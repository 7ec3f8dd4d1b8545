//!
//! The subscribing side of a topic.
//!
//! Frames arrive on the reactor and are queued together with every callback
//! registered at that moment.  The queue is swapped out and decoded on the
//! caller's thread, so callbacks never run on the reactor.
//!

use std::{
    collections::HashSet,
    net::{SocketAddr, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use tcpros_core::{MasterError, MessageError, SlaveProxy, TypeDescriptor};
use tcpros_reactor::{ConnectionHandle, ConnectionId, ReactorHandle};
use tcpros_wire::{header, ConnectionHeader};

use crate::{error::TopicError, tcp::SubscriberOutbound};

/// A type-erased subscriber callback that decodes its own copy of a payload
pub type Callback = Arc<dyn Fn(&[u8]) -> Result<(), MessageError> + Send + Sync>;

/// A connection to one publisher, identified by the publisher's uri
struct PeerConnection {
    peer: String,
    handle: ConnectionHandle,
    established: bool,
}

struct SubState {
    valid: bool,
    connections: Vec<PeerConnection>,
    callbacks: Vec<Callback>,
}

/// Every publisher connection and callback of one subscribed topic
pub struct SubTopic {
    name: String,
    descriptor: TypeDescriptor,
    caller_id: String,
    tcp_nodelay: bool,
    state: Mutex<SubState>,
    pending: Mutex<Vec<(Callback, Bytes)>>,
    /// Serializes reconciliation across the blocking `requestTopic` calls
    reconcile: Mutex<()>,
}

impl SubTopic {
    /// Create a new SubTopic without publishers or callbacks
    pub fn new(name: &str, descriptor: TypeDescriptor, caller_id: &str, tcp_nodelay: bool) -> Self {
        Self {
            name: name.to_string(),
            descriptor,
            caller_id: caller_id.to_string(),
            tcp_nodelay,
            state: Mutex::new(SubState {
                valid: true,
                connections: Vec::new(),
                callbacks: Vec::new(),
            }),
            pending: Mutex::new(Vec::new()),
            reconcile: Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Vec<(Callback, Bytes)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The resolved name of the topic
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type expected on the topic
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Whether the topic has not been shut down
    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    /// The number of publishers that completed negotiation
    pub fn num_publishers(&self) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|connection| connection.established)
            .count()
    }

    /// The uris of every publisher we are connected or connecting to
    pub fn peers(&self) -> Vec<String> {
        self.state()
            .connections
            .iter()
            .map(|connection| connection.peer.clone())
            .collect()
    }

    /// Register another callback for every future message
    pub fn add_callback(&self, callback: Callback) {
        self.state().callbacks.push(callback);
    }

    /// The header sent to a publisher when connecting
    pub fn request_header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(header::CALLER_ID, &*self.caller_id)
            .with(header::TOPIC, &*self.name)
            .with(header::TYPE, &*self.descriptor.type_name)
            .with(header::MD5SUM, &*self.descriptor.md5sum)
            .with(header::TCP_NODELAY, if self.tcp_nodelay { "1" } else { "0" })
    }

    /// Queue `payload` once for every registered callback.
    ///
    /// Runs on the reactor, so it never decodes or runs user code.
    pub fn enqueue(&self, payload: Bytes) {
        let callbacks = {
            let state = self.state();
            if !state.valid {
                return;
            }
            state.callbacks.clone()
        };

        let mut pending = self.pending();
        for callback in callbacks {
            pending.push((callback, payload.clone()));
        }
    }

    /// Decode every queued payload and hand it to its callback.
    ///
    /// Returns the number of callbacks invoked.
    pub fn invoke_callbacks(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending());
        let count = pending.len();
        for (callback, payload) in pending {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&payload[..]))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(topic = %self.name, "unable to decode message: {err}");
                }
                Err(_) => warn!(topic = %self.name, "subscriber callback panicked"),
            }
        }
        count
    }

    /// Mark a connection as negotiated.
    ///
    /// Returns false if the connection is no longer wanted.
    pub fn connection_established(&self, id: ConnectionId) -> bool {
        let mut state = self.state();
        match state
            .connections
            .iter_mut()
            .find(|connection| connection.handle.id() == id)
        {
            Some(connection) => {
                connection.established = true;
                true
            }
            None => false,
        }
    }

    /// Forget a connection that closed
    pub fn connection_closed(&self, id: ConnectionId) {
        self.state()
            .connections
            .retain(|connection| connection.handle.id() != id);
    }

    /// Bring the set of publisher connections in line with `publishers`.
    ///
    /// Publishers we have no connection to are asked for a transport and
    /// connected to; connections to publishers missing from the list are
    /// closed.  Running this twice with the same list changes nothing the
    /// second time.
    pub fn reconcile(
        self: &Arc<Self>,
        publishers: &[String],
        slave: &SlaveProxy,
        reactor: &ReactorHandle,
    ) -> Result<(), TopicError> {
        let _guard = self.reconcile.lock().unwrap_or_else(PoisonError::into_inner);

        let (stale, mut known) = {
            let mut state = self.state();
            if !state.valid {
                return Err(TopicError::TopicClosed(self.name.clone()));
            }
            let (keep, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut state.connections)
                .into_iter()
                .partition(|connection| publishers.contains(&connection.peer));
            state.connections = keep;
            let known: HashSet<String> = state
                .connections
                .iter()
                .map(|connection| connection.peer.clone())
                .collect();
            (stale, known)
        };

        for connection in stale {
            info!(topic = %self.name, peer = %connection.peer, "publisher went away");
            connection.handle.close();
        }

        for peer in publishers {
            if !known.insert(peer.clone()) {
                continue;
            }
            if let Err(err) = self.connect(peer, slave, reactor) {
                warn!(topic = %self.name, peer = %peer, "unable to connect to publisher: {err}");
            }
        }
        Ok(())
    }

    fn connect(
        self: &Arc<Self>,
        peer: &str,
        slave: &SlaveProxy,
        reactor: &ReactorHandle,
    ) -> Result<(), TopicError> {
        let transport = slave.request_topic(peer, &self.caller_id, &self.name)?;
        let addr = (transport.host.as_str(), transport.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                MasterError::InvalidUri(format!("{}:{}", transport.host, transport.port))
            })?;
        self.dial(peer, addr, reactor)
    }

    /// Connect to the publisher `peer` listening on `addr`.
    ///
    /// The connection is tracked as soon as it is scheduled and forgotten
    /// again if it fails, so the next reconcile retries the publisher.
    pub(crate) fn dial(
        self: &Arc<Self>,
        peer: &str,
        addr: SocketAddr,
        reactor: &ReactorHandle,
    ) -> Result<(), TopicError> {
        // the entry exists before the reactor can report the connection closed
        let mut state = self.state();
        if !state.valid {
            return Err(TopicError::TopicClosed(self.name.clone()));
        }
        debug!(topic = %self.name, peer, %addr, "connecting to publisher");
        let handle = reactor.connect(
            addr,
            Box::new(SubscriberOutbound::new(self.clone(), peer)),
        )?;
        state.connections.push(PeerConnection {
            peer: peer.to_string(),
            handle,
            established: false,
        });
        Ok(())
    }

    /// Mark the topic invalid and hand back its connections for closing
    pub(crate) fn invalidate(&self) -> Vec<ConnectionHandle> {
        let mut state = self.state();
        state.valid = false;
        state.callbacks.clear();
        self.pending().clear();
        std::mem::take(&mut state.connections)
            .into_iter()
            .map(|connection| connection.handle)
            .collect()
    }

    /// Mark the topic invalid and close every connection
    pub fn shutdown(&self) {
        for connection in self.invalidate() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tcpros_core::Message;

    fn counting(counter: Arc<AtomicUsize>, seen: Arc<Mutex<Vec<String>>>) -> Callback {
        Arc::new(move |payload: &[u8]| -> Result<(), MessageError> {
            let message = String::deserialize(payload)?;
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn payload(text: &str) -> Bytes {
        let mut buffer = Vec::new();
        text.to_string().serialize(&mut buffer).unwrap();
        Bytes::from(buffer)
    }

    #[test]
    fn test_each_callback_gets_every_message_in_order() {
        let topic = SubTopic::new("/chatter", String::descriptor(), "/listener", false);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        topic.add_callback(counting(counter.clone(), seen.clone()));
        topic.add_callback(counting(counter.clone(), seen.clone()));

        topic.enqueue(payload("a"));
        topic.enqueue(payload("b"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(topic.invoke_callbacks(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "a", "b", "b"]);
        assert_eq!(topic.invoke_callbacks(), 0);
    }

    #[test]
    fn test_callback_failures_are_contained() {
        let topic = SubTopic::new("/chatter", String::descriptor(), "/listener", false);
        let counter = Arc::new(AtomicUsize::new(0));
        topic.add_callback(Arc::new(|_: &[u8]| -> Result<(), MessageError> {
            panic!("callback failure")
        }));
        topic.add_callback(counting(counter.clone(), Arc::new(Mutex::new(Vec::new()))));

        topic.enqueue(Bytes::from_static(&[0xff]));
        topic.enqueue(payload("ok"));
        assert_eq!(topic.invoke_callbacks(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_drops_pending_messages() {
        let topic = SubTopic::new("/chatter", String::descriptor(), "/listener", false);
        let counter = Arc::new(AtomicUsize::new(0));
        topic.add_callback(counting(counter.clone(), Arc::new(Mutex::new(Vec::new()))));

        topic.enqueue(payload("a"));
        topic.shutdown();
        topic.enqueue(payload("b"));

        assert!(!topic.is_valid());
        assert_eq!(topic.invoke_callbacks(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_request_header() {
        let topic = SubTopic::new("/chatter", String::descriptor(), "/listener", true);
        let request = topic.request_header();
        assert_eq!(request.get(header::TOPIC), Some("/chatter"));
        assert_eq!(request.get(header::MD5SUM), Some(String::MD5SUM));
        assert_eq!(request.get(header::TCP_NODELAY), Some("1"));
    }
}
