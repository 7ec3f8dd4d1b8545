//!
//! The TCPROS connection roles used by topics.
//!
//! A remote subscriber connects to our pub/sub listener and is served by a
//! [`PublisherInbound`], while each of our subscriptions dials every known
//! publisher through a [`SubscriberOutbound`].
//!

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, info, warn};

use tcpros_reactor::{ConnectionId, Link, Protocol};
use tcpros_wire::{header, ConnectionHeader, FrameDecoder, WireError};

use crate::{pub_topic::PubTopic, sub_topic::SubTopic};

/// Every advertised topic of a node keyed by resolved name
pub type PublicationMap = Arc<Mutex<HashMap<String, Arc<PubTopic>>>>;

/// Serves one remote subscriber that connected to our listener
pub struct PublisherInbound {
    publications: PublicationMap,
    topic: Option<(ConnectionId, Arc<PubTopic>)>,
}

impl PublisherInbound {
    /// Create the role for a freshly accepted connection
    pub fn new(publications: PublicationMap) -> Self {
        Self {
            publications,
            topic: None,
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<PubTopic>> {
        self.publications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl Protocol for PublisherInbound {
    fn on_header(&mut self, request: ConnectionHeader, link: &mut Link<'_>) {
        let Some(name) = request.get(header::TOPIC) else {
            link.reject("header missing required field topic");
            return;
        };
        let Some(topic) = self.lookup(name) else {
            link.reject(&format!("no publisher for topic {name}"));
            return;
        };

        let type_name = request.get(header::TYPE);
        let md5sum = request.get(header::MD5SUM);
        if !topic.descriptor().matches_topic(type_name, md5sum) {
            link.reject(&format!(
                "client wants topic {name} to have datatype/md5sum [{}/{}], \
                 but our version has [{}]",
                type_name.unwrap_or_default(),
                md5sum.unwrap_or_default(),
                topic.descriptor(),
            ));
            return;
        }

        if request.flag(header::TCP_NODELAY) {
            link.set_nodelay(true);
        }
        link.write_header(&topic.reply_header());
        if !topic.add_connection(link) {
            link.close();
            return;
        }

        info!(
            topic = %name,
            connection = %link.id(),
            peer = request.get(header::CALLER_ID).unwrap_or("unknown"),
            "subscriber connected"
        );
        self.topic = Some((link.id(), topic));
    }

    fn on_data(&mut self, data: &[u8], _link: &mut Link<'_>) -> Result<usize, WireError> {
        // subscribers never send anything after their header
        Ok(data.len())
    }

    fn on_close(&mut self, _id: ConnectionId) {
        if let Some((id, topic)) = self.topic.take() {
            debug!(topic = %topic.name(), connection = %id, "subscriber disconnected");
            topic.remove_connection(id);
        }
    }
}

/// Dials one publisher on behalf of a subscription
pub struct SubscriberOutbound {
    topic: Arc<SubTopic>,
    peer: String,
    decoder: FrameDecoder,
}

impl SubscriberOutbound {
    /// Create the role for a connection to the publisher at `peer`
    pub fn new(topic: Arc<SubTopic>, peer: &str) -> Self {
        Self {
            topic,
            peer: peer.to_string(),
            decoder: FrameDecoder::new(),
        }
    }
}

impl Protocol for SubscriberOutbound {
    fn on_open(&mut self, link: &mut Link<'_>) {
        link.write_header(&self.topic.request_header());
    }

    fn on_header(&mut self, reply: ConnectionHeader, link: &mut Link<'_>) {
        if let Some(error) = reply.get(header::ERROR) {
            warn!(
                topic = %self.topic.name(),
                peer = %self.peer,
                "publisher refused connection: {error}"
            );
            link.close();
            return;
        }

        let type_name = reply.get(header::TYPE);
        let md5sum = reply.get(header::MD5SUM);
        if !self.topic.descriptor().matches_topic(type_name, md5sum) {
            link.reject(&format!(
                "publisher sent datatype/md5sum [{}/{}] for topic {}, but we expect [{}]",
                type_name.unwrap_or_default(),
                md5sum.unwrap_or_default(),
                self.topic.name(),
                self.topic.descriptor(),
            ));
            return;
        }

        if !self.topic.connection_established(link.id()) {
            link.close();
            return;
        }
        info!(
            topic = %self.topic.name(),
            peer = %self.peer,
            latching = reply.flag(header::LATCHING),
            "connected to publisher"
        );
    }

    fn on_data(&mut self, data: &[u8], _link: &mut Link<'_>) -> Result<usize, WireError> {
        let topic = &self.topic;
        self.decoder.decode_all(data, |frame| topic.enqueue(frame))
    }

    fn on_close(&mut self, id: ConnectionId) {
        debug!(
            topic = %self.topic.name(),
            peer = %self.peer,
            connection = %id,
            "publisher connection closed"
        );
        self.topic.connection_closed(id);
    }
}
