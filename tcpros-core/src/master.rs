//!
//! Typed wrappers around the discovery authority and peer node RPC surfaces.
//!

use std::sync::Arc;

use tracing::debug;

use crate::{
    error::MasterError,
    rpc::{RpcClient, RpcValue},
};

/// The only transport protocol this crate negotiates
pub const TCPROS: &str = "TCPROS";

/// A typed proxy for the master's registration and lookup methods
#[derive(Clone)]
pub struct MasterProxy {
    /// The uri of the master
    uri: String,
    /// The transport used to reach the master
    client: Arc<dyn RpcClient>,
}

impl MasterProxy {
    /// Create a new MasterProxy talking to the master at `uri`
    pub fn new(uri: impl Into<String>, client: Arc<dyn RpcClient>) -> Self {
        Self {
            uri: uri.into(),
            client,
        }
    }

    /// The uri of the master
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// A proxy for peer nodes sharing this master's transport
    pub fn slave(&self) -> SlaveProxy {
        SlaveProxy::new(self.client.clone())
    }

    fn call(&self, method: &'static str, args: Vec<RpcValue>) -> Result<RpcValue, MasterError> {
        debug!(method, master = %self.uri, "calling master");
        self.client.call(&self.uri, method, args)?.into_result()
    }

    fn string_list(method: &'static str, value: RpcValue) -> Result<Vec<String>, MasterError> {
        value
            .as_string_list()
            .ok_or(MasterError::UnexpectedValue { method })
    }

    /// Register `caller_api` as a publisher of `topic`, returning the current subscriber apis
    pub fn register_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        topic_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>, MasterError> {
        let value = self.call(
            "registerPublisher",
            vec![caller_id.into(), topic.into(), topic_type.into(), caller_api.into()],
        )?;
        Self::string_list("registerPublisher", value)
    }

    /// Unregister `caller_api` as a publisher of `topic`
    pub fn unregister_publisher(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<i32, MasterError> {
        let value = self.call(
            "unregisterPublisher",
            vec![caller_id.into(), topic.into(), caller_api.into()],
        )?;
        Ok(value.as_int().unwrap_or_default())
    }

    /// Register `caller_api` as a subscriber of `topic`, returning the current publisher apis
    pub fn register_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        topic_type: &str,
        caller_api: &str,
    ) -> Result<Vec<String>, MasterError> {
        let value = self.call(
            "registerSubscriber",
            vec![caller_id.into(), topic.into(), topic_type.into(), caller_api.into()],
        )?;
        Self::string_list("registerSubscriber", value)
    }

    /// Unregister `caller_api` as a subscriber of `topic`
    pub fn unregister_subscriber(
        &self,
        caller_id: &str,
        topic: &str,
        caller_api: &str,
    ) -> Result<i32, MasterError> {
        let value = self.call(
            "unregisterSubscriber",
            vec![caller_id.into(), topic.into(), caller_api.into()],
        )?;
        Ok(value.as_int().unwrap_or_default())
    }

    /// Register the service `service` served at `service_api`
    pub fn register_service(
        &self,
        caller_id: &str,
        service: &str,
        service_api: &str,
        caller_api: &str,
    ) -> Result<(), MasterError> {
        self.call(
            "registerService",
            vec![caller_id.into(), service.into(), service_api.into(), caller_api.into()],
        )?;
        Ok(())
    }

    /// Unregister the service `service` served at `service_api`
    pub fn unregister_service(
        &self,
        caller_id: &str,
        service: &str,
        service_api: &str,
    ) -> Result<i32, MasterError> {
        let value = self.call(
            "unregisterService",
            vec![caller_id.into(), service.into(), service_api.into()],
        )?;
        Ok(value.as_int().unwrap_or_default())
    }

    /// Look up the `rosrpc://` uri of the provider of `service`
    pub fn lookup_service(&self, caller_id: &str, service: &str) -> Result<String, MasterError> {
        let value = self.call("lookupService", vec![caller_id.into(), service.into()])?;
        value
            .as_str()
            .map(String::from)
            .ok_or(MasterError::UnexpectedValue {
                method: "lookupService",
            })
    }
}

/// The address a publisher told us to connect to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicTransport {
    /// The negotiated protocol name
    pub protocol: String,
    /// The host to connect to
    pub host: String,
    /// The port to connect to
    pub port: u16,
}

/// A typed proxy for the methods peer nodes expose to each other
#[derive(Clone)]
pub struct SlaveProxy {
    client: Arc<dyn RpcClient>,
}

impl SlaveProxy {
    /// Create a new SlaveProxy
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self { client }
    }

    /// Ask the publisher at `peer_uri` for a TCPROS endpoint serving `topic`
    pub fn request_topic(
        &self,
        peer_uri: &str,
        caller_id: &str,
        topic: &str,
    ) -> Result<TopicTransport, MasterError> {
        let protocols = RpcValue::Array(vec![RpcValue::Array(vec![TCPROS.into()])]);
        debug!(peer = peer_uri, topic, "requesting topic");
        let value = self
            .client
            .call(
                peer_uri,
                "requestTopic",
                vec![caller_id.into(), topic.into(), protocols],
            )?
            .into_result()?;

        let unexpected = MasterError::UnexpectedValue {
            method: "requestTopic",
        };
        match value.as_array() {
            Some([RpcValue::Str(protocol), RpcValue::Str(host), RpcValue::Int(port)])
                if protocol == TCPROS =>
            {
                let port = u16::try_from(*port).map_err(|_| unexpected)?;
                Ok(TopicTransport {
                    protocol: protocol.clone(),
                    host: host.clone(),
                    port,
                })
            }
            _ => Err(unexpected),
        }
    }
}
