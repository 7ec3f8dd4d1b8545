//!
//! The TCPROS connection roles used by services.
//!

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, warn};

use tcpros_core::TypeDescriptor;
use tcpros_reactor::{ConnectionId, Link, Protocol};
use tcpros_wire::{header, ConnectionHeader, FrameDecoder, ResponseDecoder, WireError};

use crate::{endpoint::ServiceEndpoint, error::CallError, proxy::ProxyMonitor};

/// Every advertised service of a node keyed by resolved name
pub type ServiceMap = Arc<Mutex<HashMap<String, Arc<ServiceEndpoint>>>>;

/// The header field a client sets to only ask for the service's type
const PROBE: &str = "probe";

/// Serves one remote client that connected to our service listener
pub struct ServiceInbound {
    services: ServiceMap,
    endpoint: Option<(ConnectionId, Arc<ServiceEndpoint>)>,
    decoder: FrameDecoder,
}

impl ServiceInbound {
    /// Create the role for a freshly accepted connection
    pub fn new(services: ServiceMap) -> Self {
        Self {
            services,
            endpoint: None,
            decoder: FrameDecoder::new(),
        }
    }
}

impl Protocol for ServiceInbound {
    fn on_header(&mut self, request: ConnectionHeader, link: &mut Link<'_>) {
        let Some(name) = request.get(header::SERVICE) else {
            link.reject("header missing required field service");
            return;
        };
        let endpoint = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let Some(endpoint) = endpoint else {
            link.reject(&format!("service {name} not found"));
            return;
        };

        let caller_id = request.get(header::CALLER_ID).unwrap_or("unknown");
        let md5sum = request.get(header::MD5SUM);
        if !endpoint
            .descriptor()
            .matches_service(request.get(header::TYPE), md5sum)
        {
            link.reject(&format!(
                "request from [{caller_id}]: md5sums do not match: [{}] vs. [{}]",
                md5sum.unwrap_or_default(),
                endpoint.descriptor().md5sum,
            ));
            return;
        }

        link.write_header(&endpoint.reply_header());
        if request.flag(PROBE) {
            link.close_after_writing();
            return;
        }
        if !endpoint.add_connection(link) {
            link.close();
            return;
        }

        debug!(service = %name, connection = %link.id(), peer = caller_id, "client connected");
        self.endpoint = Some((link.id(), endpoint));
    }

    fn on_data(&mut self, data: &[u8], link: &mut Link<'_>) -> Result<usize, WireError> {
        let Some((_, endpoint)) = self.endpoint.as_ref() else {
            return Ok(data.len());
        };
        let handle = link.handle();
        self.decoder
            .decode_all(data, |request| endpoint.enqueue(handle.clone(), request))
    }

    fn on_close(&mut self, _id: ConnectionId) {
        if let Some((id, endpoint)) = self.endpoint.take() {
            debug!(service = %endpoint.name(), connection = %id, "client disconnected");
            endpoint.remove_connection(id);
        }
    }
}

/// Connects a [`ServiceProxy`](crate::ServiceProxy) to its provider
pub struct ServiceOutbound {
    service: String,
    descriptor: TypeDescriptor,
    request: ConnectionHeader,
    monitor: Arc<ProxyMonitor>,
    decoder: ResponseDecoder,
}

impl ServiceOutbound {
    /// Create the role sending `request` as its header
    pub fn new(
        service: String,
        descriptor: TypeDescriptor,
        request: ConnectionHeader,
        monitor: Arc<ProxyMonitor>,
    ) -> Self {
        Self {
            service,
            descriptor,
            request,
            monitor,
            decoder: ResponseDecoder::new(),
        }
    }
}

impl Protocol for ServiceOutbound {
    fn on_open(&mut self, link: &mut Link<'_>) {
        link.write_header(&self.request);
    }

    fn on_header(&mut self, reply: ConnectionHeader, link: &mut Link<'_>) {
        let failure = if let Some(error) = reply.get(header::ERROR) {
            Some(error.to_string())
        } else if !reply.contains(header::CALLER_ID) {
            Some("service reply is missing callerid".to_string())
        } else {
            let type_name = reply.get(header::TYPE);
            match reply.get(header::MD5SUM) {
                Some(md5sum) if !self.descriptor.matches_service(type_name, Some(md5sum)) => {
                    Some(format!(
                        "service {} has md5sum [{md5sum}], but we expect [{}]",
                        self.service, self.descriptor.md5sum
                    ))
                }
                _ => None,
            }
        };

        match failure {
            Some(message) => {
                warn!(
                    service = %self.service,
                    connection = %link.id(),
                    "service negotiation failed: {message}"
                );
                self.monitor.fail(link.id(), CallError::Negotiation(message));
                link.close();
            }
            None => {
                debug!(
                    service = %self.service,
                    connection = %link.id(),
                    "service connection ready"
                );
                self.monitor.ready(link.id());
            }
        }
    }

    fn on_data(&mut self, data: &[u8], link: &mut Link<'_>) -> Result<usize, WireError> {
        let mut consumed = 0;
        loop {
            let (used, response) = self.decoder.decode(&data[consumed..])?;
            consumed += used;
            match response {
                Some(response) => self.monitor.complete(link.id(), response),
                None => return Ok(consumed),
            }
        }
    }

    fn on_close(&mut self, id: ConnectionId) {
        self.monitor.closed(id);
    }
}
