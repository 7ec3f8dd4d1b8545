//!
//! The composition root of a TCPROS process.
//!
//! A [`RosNode`] owns the reactor servicing every socket and the topic and
//! service managers sharing it.  User callbacks only ever run on the thread
//! calling [`RosNode::spin_once`] (or [`RosNode::spin`]).
//!

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, SystemTime},
};

use quanta::Clock;
use tracing::{debug, info, warn};

use tcpros_clients_and_servers::{ServiceError, ServiceManager, ServiceProxy, ServiceServer};
use tcpros_core::{
    MasterError, MasterProxy, Message, NameResolver, Namespace, Node, NodeIdentity, RpcClient,
    ServiceType,
};
use tcpros_publishers_and_subscribers::{Publisher, Subscriber, TopicError, TopicManager};
use tcpros_reactor::Reactor;

use crate::{
    config::NodeConfig,
    error::NodeError,
    slave::{ShutdownSignal, SlaveApi},
    time::{period_of, Rate, Timer, TimerEvent, TimerQueue},
};

/// How long `wait_for_service` sleeps between two lookups
pub const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

type ShutdownHook = Box<dyn FnOnce(&str) + Send>;

/// One participant in the graph
pub struct RosNode {
    config: NodeConfig,
    resolver: Arc<Namespace>,
    identity: NodeIdentity,
    master: MasterProxy,
    reactor: Mutex<Reactor>,
    topics: TopicManager,
    services: ServiceManager,
    signal: Arc<ShutdownSignal>,
    finished: AtomicBool,
    hooks: Mutex<Vec<ShutdownHook>>,
    timers: TimerQueue,
    clock: Clock,
}

impl RosNode {
    /// Start a node: spawn its reactor and open the topic and service listeners.
    ///
    /// `rpc` carries every call to the master and to peer nodes.
    pub fn new(config: NodeConfig, rpc: Arc<dyn RpcClient>) -> Result<Self, NodeError> {
        config.validate()?;
        let resolver = Arc::new(config.resolver());
        let identity = NodeIdentity {
            caller_id: resolver.node_name().to_string(),
            caller_api: config.node_uri().unwrap_or_default().to_string(),
            host: config.host().to_string(),
        };
        let master = MasterProxy::new(config.master_uri(), rpc);
        let reactor = Reactor::spawn()?;

        let topics = TopicManager::new(
            identity.clone(),
            master.clone(),
            reactor.handle(),
            resolver.clone(),
        )?
        .with_tcp_nodelay(config.tcp_nodelay());
        let services = ServiceManager::new(
            identity.clone(),
            master.clone(),
            reactor.handle(),
            resolver.clone(),
        )?;

        info!(
            node = %identity.caller_id,
            master = %config.master_uri(),
            node_uri = %identity.caller_api,
            topic_port = topics.port(),
            service_port = services.port(),
            "node started"
        );

        let clock = Clock::new();
        Ok(Self {
            config,
            resolver,
            identity,
            master,
            reactor: Mutex::new(reactor),
            topics,
            services,
            signal: Arc::new(ShutdownSignal::default()),
            finished: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            timers: TimerQueue::new(clock.clone()),
            clock,
        })
    }

    /// The node's configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The fully qualified node name
    pub fn get_name(&self) -> &str {
        &self.identity.caller_id
    }

    /// The namespace relative names resolve into
    pub fn get_namespace(&self) -> &str {
        self.resolver.namespace()
    }

    /// The uri of the node's RPC server
    pub fn get_node_uri(&self) -> &str {
        &self.identity.caller_api
    }

    /// The master's uri
    pub fn get_master_uri(&self) -> &str {
        self.master.uri()
    }

    /// The host name or address peers use to reach this node
    pub fn get_ip(&self) -> &str {
        self.config.host()
    }

    /// The current time, which is always wall-clock time
    pub fn get_rostime(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Block the calling thread for `duration`
    pub fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    /// A [`Rate`] of `hz` iterations per second
    pub fn rate(&self, hz: f64) -> Result<Rate, NodeError> {
        let period = period_of(hz).ok_or_else(|| NodeError::InvalidPeriod(format!("{hz} Hz")))?;
        Ok(Rate::with_clock(self.clock.clone(), period))
    }

    /// Run `callback` every `period`, or only once after `period` if
    /// `oneshot` is set.
    ///
    /// Like every other callback it only runs from `spin_once`.
    pub fn create_timer<F>(
        &self,
        period: Duration,
        oneshot: bool,
        callback: F,
    ) -> Result<Timer, NodeError>
    where
        F: FnMut(&TimerEvent) + Send + 'static,
    {
        if period.is_zero() {
            return Err(NodeError::InvalidPeriod(format!("{period:?}")));
        }
        if !self.ok() {
            return Err(NodeError::ShuttingDown);
        }
        Ok(self.timers.add(period, oneshot, Box::new(callback)))
    }

    /// Resolve `name` the way every topic and service name of this node is resolved
    pub fn resolve_name(&self, name: &str) -> String {
        self.resolver.resolve(name)
    }

    /// The topic manager
    pub fn topics(&self) -> &TopicManager {
        &self.topics
    }

    /// The service manager
    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// The slave API surface to mount on the node's RPC server
    pub fn slave_api(&self) -> SlaveApi {
        SlaveApi::new(
            &self.identity.caller_id,
            self.master.uri(),
            self.topics.clone(),
            self.signal.clone(),
        )
    }

    /// Advertise `topic`
    pub fn advertise<M: Message>(
        &self,
        topic: &str,
        latching: bool,
    ) -> Result<Publisher<M>, TopicError> {
        self.topics.advertise(topic, latching)
    }

    /// Subscribe to `topic`, handing every message to `callback` during `spin_once`
    pub fn subscribe<M, F>(&self, topic: &str, callback: F) -> Result<Subscriber<M>, TopicError>
    where
        M: Message,
        F: Fn(M) + Send + Sync + 'static,
    {
        self.topics.subscribe(topic, callback)
    }

    /// Advertise `service`, answering requests during `spin_once`
    pub fn advertise_service<S, F>(
        &self,
        service: &str,
        handler: F,
    ) -> Result<ServiceServer<S>, ServiceError>
    where
        S: ServiceType,
        F: Fn(S::Request) -> Result<S::Response, String> + Send + Sync + 'static,
    {
        self.services.advertise_service(service, handler)
    }

    /// Create a proxy for calling `service`
    pub fn service_proxy<S: ServiceType>(
        &self,
        service: &str,
        persistent: bool,
    ) -> Result<ServiceProxy<S>, ServiceError> {
        self.services.service_proxy(service, persistent)
    }

    /// Block until the master knows a provider for `service`.
    ///
    /// Waits forever without a timeout.
    pub fn wait_for_service(
        &self,
        service: &str,
        timeout: Option<Duration>,
    ) -> Result<(), NodeError> {
        let name = self.resolve_name(service);
        let deadline = timeout.map(|timeout| self.clock.now() + timeout);
        debug!(service = %name, "waiting for service");
        loop {
            if !self.ok() {
                return Err(NodeError::ShuttingDown);
            }
            match self.services.lookup_service(service) {
                Ok(uri) => {
                    debug!(service = %name, %uri, "service found");
                    return Ok(());
                }
                Err(ServiceError::Master(MasterError::Status { .. })) => {}
                Err(err) => return Err(err.into()),
            }
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                return Err(NodeError::Timeout(name));
            }
            thread::sleep(SERVICE_POLL_INTERVAL);
        }
    }

    /// Hand every queued message to its subscriber callbacks and every
    /// queued request to its service handler, then fire the timers that are
    /// due.
    ///
    /// Returns the number of callbacks run.
    pub fn spin_once(&self) -> usize {
        self.topics.invoke_callbacks() + self.services.invoke_callbacks() + self.timers.fire_due()
    }

    /// Run `spin_once` at the configured rate until shutdown is requested,
    /// then shut the node down.
    pub fn spin(&self) {
        let mut rate = Rate::with_clock(self.clock.clone(), self.config.spin_period());
        while self.ok() {
            self.spin_once();
            rate.sleep();
        }
        self.signal_shutdown(&self.signal.reason().unwrap_or_default());
    }

    /// Whether the node has not been asked to shut down
    pub fn ok(&self) -> bool {
        !self.signal.is_requested()
    }

    /// Register `hook` to run with the shutdown reason when the node shuts down
    pub fn on_shutdown<F: FnOnce(&str) + Send + 'static>(&self, hook: F) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Shut the node down.  The shutdown hooks run first, then every timer,
    /// topic and service is torn down and the reactor stops.
    ///
    /// Only the first call does anything.  Callable from any thread.
    pub fn signal_shutdown(&self, reason: &str) {
        self.signal.request(reason);
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let reason = self.signal.reason().unwrap_or_default();
        info!(node = %self.identity.caller_id, %reason, "shutting down");

        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        for hook in hooks {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(&reason))).is_err() {
                warn!(node = %self.identity.caller_id, "shutdown hook panicked");
            }
        }

        self.timers.shutdown();
        self.topics.shutdown();
        self.services.shutdown();
        self.reactor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        info!(node = %self.identity.caller_id, "shutdown complete");
    }

    /// Whether `signal_shutdown` has run
    pub fn is_shutdown(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Node for RosNode {
    fn get_update_delay_us(&self) -> u128 {
        self.config.spin_period().as_micros()
    }

    fn start(&mut self) {
        debug!(node = %self.identity.caller_id, "node driven by an external executor");
    }

    fn update(&mut self) {
        if self.ok() {
            self.spin_once();
        } else {
            self.signal_shutdown(&self.signal.reason().unwrap_or_default());
        }
    }

    fn shutdown(&mut self) {
        self.signal_shutdown("node shutdown");
    }
}

impl Drop for RosNode {
    fn drop(&mut self) {
        self.signal_shutdown("node dropped");
    }
}
