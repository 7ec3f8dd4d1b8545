//!
//! The RPC surface a node exposes to the master and its peers.
//!
//! The RPC server itself lives outside this crate; it only has to decode a
//! method call and hand it to [`SlaveApi::dispatch`].
//!

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use tracing::{debug, info, warn};

use tcpros_core::{RpcResponse, RpcValue};
use tcpros_publishers_and_subscribers::TopicManager;

/// The reason recorded when the master asks a node to stop without giving one
pub const REMOTE_SHUTDOWN: &str = "shutdown requested by remote";

/// A shutdown request shared between the node and its RPC surface
#[derive(Default)]
pub(crate) struct ShutdownSignal {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ShutdownSignal {
    /// Record a request, keeping the first reason given
    pub(crate) fn request(&self, reason: &str) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(reason.to_string());
        }
        self.requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Answers the slave API methods for one node
#[derive(Clone)]
pub struct SlaveApi {
    caller_id: String,
    master_uri: String,
    topics: TopicManager,
    signal: Arc<ShutdownSignal>,
}

impl SlaveApi {
    pub(crate) fn new(
        caller_id: &str,
        master_uri: &str,
        topics: TopicManager,
        signal: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            caller_id: caller_id.to_string(),
            master_uri: master_uri.to_string(),
            topics,
            signal,
        }
    }

    /// The node this surface answers for
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    /// Answer the call of `method` with the positional `args`.
    ///
    /// Every method takes the caller id as its first argument.  Unknown
    /// methods and malformed arguments answer with an error status.
    pub fn dispatch(&self, method: &str, args: &[RpcValue]) -> RpcResponse {
        debug!(node = %self.caller_id, method, "slave api call");
        match method {
            "getBusStats" | "getBusInfo" => RpcResponse::failure("not implemented"),
            "getMasterUri" => RpcResponse::success("", &*self.master_uri),
            "getPid" => RpcResponse::success("", std::process::id() as i32),
            "getPublications" => {
                RpcResponse::success("", Self::pairs(self.topics.get_publications()))
            }
            "getSubscriptions" => {
                RpcResponse::success("", Self::pairs(self.topics.get_subscriptions()))
            }
            "paramUpdate" => RpcResponse::success("", RpcValue::Int(0)),
            "shutdown" => {
                let reason = args
                    .get(1)
                    .and_then(RpcValue::as_str)
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or(REMOTE_SHUTDOWN);
                info!(node = %self.caller_id, reason, "shutdown requested");
                self.signal.request(reason);
                RpcResponse::success("shutdown", RpcValue::Int(0))
            }
            "publisherUpdate" => self.publisher_update(args),
            "requestTopic" => self.request_topic(args),
            _ => RpcResponse::error(format!("unknown method {method}")),
        }
    }

    fn pairs(topics: Vec<(String, String)>) -> Vec<Vec<String>> {
        topics
            .into_iter()
            .map(|(name, type_name)| vec![name, type_name])
            .collect()
    }

    fn publisher_update(&self, args: &[RpcValue]) -> RpcResponse {
        let (Some(topic), Some(publishers)) = (
            args.get(1).and_then(RpcValue::as_str),
            args.get(2).and_then(RpcValue::as_string_list),
        ) else {
            return RpcResponse::error("publisherUpdate expects a topic and a list of publishers");
        };

        match self.topics.publisher_update(topic, &publishers) {
            Ok(()) => RpcResponse::success("", RpcValue::Int(0)),
            Err(err) => {
                warn!(node = %self.caller_id, topic, "publisher update failed: {err}");
                RpcResponse::failure(err.to_string())
            }
        }
    }

    fn request_topic(&self, args: &[RpcValue]) -> RpcResponse {
        let (Some(topic), Some(protocols)) = (
            args.get(1).and_then(RpcValue::as_str),
            args.get(2).and_then(RpcValue::as_array),
        ) else {
            return RpcResponse::error("requestTopic expects a topic and a list of protocols");
        };

        let names: Vec<String> = protocols
            .iter()
            .filter_map(|protocol| protocol.as_array()?.first()?.as_str().map(String::from))
            .collect();
        match self.topics.request_topic(topic, &names) {
            Some(transport) => RpcResponse::success(
                "protocol matched",
                RpcValue::Array(vec![
                    transport.protocol.into(),
                    transport.host.into(),
                    RpcValue::Int(i32::from(transport.port)),
                ]),
            ),
            None => RpcResponse::failure("requested topic is not found"),
        }
    }
}
