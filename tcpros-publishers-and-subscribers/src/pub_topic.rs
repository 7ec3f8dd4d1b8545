//!
//! The publishing side of a topic.
//!

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::debug;

use tcpros_core::{Message, TypeDescriptor};
use tcpros_reactor::{ConnectionHandle, ConnectionId, Link};
use tcpros_wire::{encode_frame, header, ConnectionHeader};

use crate::error::TopicError;

struct PubState {
    valid: bool,
    connections: Vec<ConnectionHandle>,
    /// The last published frame, length prefix included
    latched: Option<Bytes>,
}

/// Every subscriber connection of one advertised topic
pub struct PubTopic {
    name: String,
    descriptor: TypeDescriptor,
    caller_id: String,
    latching: bool,
    state: Mutex<PubState>,
}

impl PubTopic {
    /// Create a new, connectionless PubTopic
    pub fn new(name: &str, descriptor: TypeDescriptor, caller_id: &str, latching: bool) -> Self {
        Self {
            name: name.to_string(),
            descriptor,
            caller_id: caller_id.to_string(),
            latching,
            state: Mutex::new(PubState {
                valid: true,
                connections: Vec::new(),
                latched: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The resolved name of the topic
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type published on the topic
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Whether new subscribers receive the last published message
    pub fn is_latching(&self) -> bool {
        self.latching
    }

    /// Whether the topic has not been shut down
    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    /// The number of negotiated subscriber connections
    pub fn num_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// The header sent back to an accepted subscriber
    pub fn reply_header(&self) -> ConnectionHeader {
        ConnectionHeader::new()
            .with(header::CALLER_ID, &*self.caller_id)
            .with(header::TOPIC, &*self.name)
            .with(header::TYPE, &*self.descriptor.type_name)
            .with(header::MD5SUM, &*self.descriptor.md5sum)
            .with(header::LATCHING, if self.latching { "1" } else { "0" })
    }

    /// Serialize `message` and send it to every connected subscriber
    pub fn publish<M: Message>(&self, message: &M) -> Result<(), TopicError> {
        let mut payload = Vec::new();
        message.serialize(&mut payload)?;
        self.publish_bytes(&payload)
    }

    /// Send an already serialized payload to every connected subscriber.
    ///
    /// Publishing with no subscribers is a no-op.
    pub fn publish_bytes(&self, payload: &[u8]) -> Result<(), TopicError> {
        let mut state = self.state();
        if !state.valid {
            return Err(TopicError::TopicClosed(self.name.clone()));
        }

        let frame = encode_frame(payload);
        for connection in state.connections.iter() {
            if let Err(err) = connection.write(frame.clone()) {
                debug!(topic = %self.name, connection = %connection.id(), "dropping frame: {err}");
            }
        }
        if self.latching {
            state.latched = Some(frame);
        }
        Ok(())
    }

    /// Register a negotiated connection, replaying the latched frame to it.
    ///
    /// Returns false if the topic was shut down in the meantime.
    pub fn add_connection(&self, link: &mut Link<'_>) -> bool {
        let mut state = self.state();
        if !state.valid {
            return false;
        }
        if let Some(latched) = state.latched.as_ref() {
            link.write(latched);
        }
        state.connections.push(link.handle());
        true
    }

    /// Forget a connection that closed
    pub fn remove_connection(&self, id: ConnectionId) {
        self.state()
            .connections
            .retain(|connection| connection.id() != id);
    }

    /// Mark the topic invalid and hand back its connections for closing
    pub(crate) fn invalidate(&self) -> Vec<ConnectionHandle> {
        let mut state = self.state();
        state.valid = false;
        state.latched = None;
        std::mem::take(&mut state.connections)
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

    #[test]
    fn test_publish_after_shutdown_fails() {
        let topic = PubTopic::new("/chatter", String::descriptor(), "/talker", true);
        topic.publish(&"hello".to_string()).unwrap();
        topic.shutdown();

        assert!(!topic.is_valid());
        assert!(matches!(
            topic.publish(&"again".to_string()),
            Err(TopicError::TopicClosed(name)) if name == "/chatter"
        ));
    }

    #[test]
    fn test_reply_header() {
        let topic = PubTopic::new("/chatter", String::descriptor(), "/talker", true);
        let reply = topic.reply_header();
        assert_eq!(reply.get(header::CALLER_ID), Some("/talker"));
        assert_eq!(reply.get(header::TYPE), Some("std_msgs/String"));
        assert_eq!(reply.get(header::LATCHING), Some("1"));
        assert_eq!(topic.num_connections(), 0);
    }
}
