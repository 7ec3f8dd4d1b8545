//!
//! An in-memory master for driving real nodes over loopback sockets.
//!
//! Master methods are answered from a registry.  Calls addressed to a node
//! uri are routed to the [`SlaveApi`] registered for that uri, so
//! `requestTopic` and `publisherUpdate` travel the same path they would
//! through a real RPC server.
//!

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Once},
    thread,
    time::{Duration, Instant},
};

use tcpros::{
    core::{MasterError, RpcClient, RpcResponse, RpcValue},
    NodeConfig, RosNode, SlaveApi,
};

pub const MASTER_URI: &str = "http://master.test:11311/";

#[derive(Default)]
struct Graph {
    publishers: HashMap<String, Vec<String>>,
    subscribers: HashMap<String, Vec<String>>,
    services: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeMaster {
    graph: Mutex<Graph>,
    nodes: Mutex<HashMap<String, SlaveApi>>,
    calls: Mutex<Vec<(String, String)>>,
    next_port: Mutex<u16>,
}

fn arg(args: &[RpcValue], index: usize) -> String {
    args.get(index)
        .and_then(RpcValue::as_str)
        .unwrap_or_default()
        .to_string()
}

impl FakeMaster {
    pub fn new() -> Arc<Self> {
        init_logging();
        Arc::new(Self::default())
    }

    /// Start a node talking to this master and route its slave api calls
    pub fn node(self: &Arc<Self>, name: &str) -> RosNode {
        let port = {
            let mut next_port = self.next_port.lock().unwrap();
            *next_port += 1;
            40_000 + *next_port
        };
        let node_uri = format!("http://127.0.0.1:{port}/");
        let config = NodeConfig::new(name, MASTER_URI).with_node_uri(&node_uri);
        let node = RosNode::new(config, self.clone()).unwrap();
        self.nodes
            .lock()
            .unwrap()
            .insert(node_uri, node.slave_api());
        node
    }

    /// Every master method called so far by `caller_id`
    pub fn calls_from(&self, caller_id: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(caller, _)| caller == caller_id)
            .map(|(_, method)| method.clone())
            .collect()
    }

    pub fn publishers(&self, topic: &str) -> Vec<String> {
        self.graph
            .lock()
            .unwrap()
            .publishers
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn service(&self, service: &str) -> Option<String> {
        self.graph.lock().unwrap().services.get(service).cloned()
    }

    /// Call a slave api method on the node serving `node_uri`
    pub fn call_node(&self, node_uri: &str, method: &str, args: Vec<RpcValue>) -> RpcResponse {
        self.call(node_uri, method, args).unwrap()
    }

    fn notify_subscribers(&self, topic: &str) {
        let (subscribers, publishers) = {
            let graph = self.graph.lock().unwrap();
            (
                graph.subscribers.get(topic).cloned().unwrap_or_default(),
                graph.publishers.get(topic).cloned().unwrap_or_default(),
            )
        };
        for subscriber in subscribers {
            let _ = self.call(
                &subscriber,
                "publisherUpdate",
                vec!["/master".into(), topic.into(), publishers.clone().into()],
            );
        }
    }

    fn master(&self, method: &str, args: &[RpcValue]) -> RpcResponse {
        self.calls
            .lock()
            .unwrap()
            .push((arg(args, 0), method.to_string()));
        let topic = arg(args, 1);
        match method {
            "registerPublisher" => {
                let subscribers = {
                    let mut graph = self.graph.lock().unwrap();
                    let publishers = graph.publishers.entry(topic.clone()).or_default();
                    let api = arg(args, 3);
                    if !publishers.contains(&api) {
                        publishers.push(api);
                    }
                    graph.subscribers.get(&topic).cloned().unwrap_or_default()
                };
                self.notify_subscribers(&topic);
                RpcResponse::success("", subscribers)
            }
            "unregisterPublisher" => {
                let api = arg(args, 2);
                self.graph
                    .lock()
                    .unwrap()
                    .publishers
                    .entry(topic.clone())
                    .or_default()
                    .retain(|publisher| *publisher != api);
                self.notify_subscribers(&topic);
                RpcResponse::success("", RpcValue::Int(1))
            }
            "registerSubscriber" => {
                let mut graph = self.graph.lock().unwrap();
                let subscribers = graph.subscribers.entry(topic.clone()).or_default();
                let api = arg(args, 3);
                if !subscribers.contains(&api) {
                    subscribers.push(api);
                }
                RpcResponse::success("", graph.publishers.get(&topic).cloned().unwrap_or_default())
            }
            "unregisterSubscriber" => {
                let api = arg(args, 2);
                self.graph
                    .lock()
                    .unwrap()
                    .subscribers
                    .entry(topic)
                    .or_default()
                    .retain(|subscriber| *subscriber != api);
                RpcResponse::success("", RpcValue::Int(1))
            }
            "registerService" => {
                self.graph
                    .lock()
                    .unwrap()
                    .services
                    .insert(topic, arg(args, 2));
                RpcResponse::success("", RpcValue::Int(1))
            }
            "unregisterService" => {
                let mut graph = self.graph.lock().unwrap();
                if graph.services.get(&topic) == Some(&arg(args, 2)) {
                    graph.services.remove(&topic);
                    RpcResponse::success("", RpcValue::Int(1))
                } else {
                    RpcResponse::success("", RpcValue::Int(0))
                }
            }
            "lookupService" => match self.graph.lock().unwrap().services.get(&topic) {
                Some(uri) => RpcResponse::success("", uri.as_str()),
                None => RpcResponse::error(format!("no provider for [{topic}]")),
            },
            _ => RpcResponse::error(format!("unknown method {method}")),
        }
    }
}

impl RpcClient for FakeMaster {
    fn call(
        &self,
        uri: &str,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcResponse, MasterError> {
        if uri == MASTER_URI {
            return Ok(self.master(method, &args));
        }
        let slave = self.nodes.lock().unwrap().get(uri).cloned();
        match slave {
            Some(slave) => Ok(slave.dispatch(method, &args)),
            None => Err(MasterError::Transport(format!("connection refused: {uri}"))),
        }
    }
}

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spin `nodes` until `condition` holds, failing the test after five seconds
pub fn spin_until(nodes: &[&RosNode], condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        for node in nodes {
            node.spin_once();
        }
        thread::sleep(Duration::from_millis(2));
    }
}
