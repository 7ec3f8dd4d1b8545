//!
//! The per-node registry of advertised services and service proxies.
//!

use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tracing::{info, warn};

use tcpros_core::{
    rpc::parse_uri, MasterError, MasterProxy, NameResolver, NodeIdentity, ServiceType,
};
use tcpros_reactor::{ListenerHandle, Protocol, ReactorHandle};

use crate::{
    endpoint::{erase, ServiceEndpoint, ServiceServer},
    error::{CallError, ServiceError},
    proxy::{Lookup, ProxyMonitor, ServiceProxy},
    tcp::{ServiceInbound, ServiceMap},
};

struct Inner {
    identity: NodeIdentity,
    master: MasterProxy,
    reactor: ReactorHandle,
    resolver: Arc<dyn NameResolver>,
    listener: ListenerHandle,
    registration: Mutex<()>,
    services: ServiceMap,
    proxies: Mutex<Vec<Weak<ProxyMonitor>>>,
    shut_down: AtomicBool,
}

/// Owns every service of a node and the listener clients connect to
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

/// Resolve the `rosrpc://host:port` uri of a service provider
pub fn resolve_service_uri(uri: &str) -> Result<SocketAddr, MasterError> {
    let (host, port) = parse_uri(uri)?;
    (host.as_str(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| MasterError::InvalidUri(uri.to_string()))
}

impl ServiceManager {
    /// Create a new ServiceManager and start its listener on an ephemeral port
    pub fn new(
        identity: NodeIdentity,
        master: MasterProxy,
        reactor: ReactorHandle,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<Self, ServiceError> {
        let services: ServiceMap = Arc::new(Mutex::new(HashMap::new()));
        let factory_services = services.clone();
        let listener = reactor.listen("0.0.0.0:0", move || {
            Box::new(ServiceInbound::new(factory_services.clone())) as Box<dyn Protocol>
        })?;
        info!(port = listener.port(), "service listener started");

        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                master,
                reactor,
                resolver,
                listener,
                registration: Mutex::new(()),
                services,
                proxies: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn registration(&self) -> MutexGuard<'_, ()> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, Arc<ServiceEndpoint>>> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The port remote clients connect to
    pub fn port(&self) -> u16 {
        self.inner.listener.port()
    }

    /// The `rosrpc://` uri our services are registered under
    pub fn service_api(&self) -> String {
        format!("rosrpc://{}:{}", self.inner.identity.host, self.port())
    }

    /// Whether [`ServiceManager::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Advertise `service`, answering every request with `handler`.
    ///
    /// Advertising a service that is already advertised with the same type
    /// keeps the existing endpoint and its handler; advertising it with a
    /// different type tears the old one down first.
    pub fn advertise_service<S, F>(
        &self,
        service: &str,
        handler: F,
    ) -> Result<ServiceServer<S>, ServiceError>
    where
        S: ServiceType,
        F: Fn(S::Request) -> Result<S::Response, String> + Send + Sync + 'static,
    {
        let name = self.inner.resolver.resolve(service);
        let descriptor = S::descriptor();
        let _guard = self.registration();
        if self.is_shutdown() {
            return Err(ServiceError::ServiceClosed(name));
        }

        let existing = self.services().get(&name).cloned();
        if let Some(existing) = existing {
            if existing.descriptor() == &descriptor && existing.is_valid() {
                return Ok(ServiceServer::new(existing, self.clone()));
            }
            info!(
                service = %name,
                old = %existing.descriptor(),
                new = %descriptor,
                "replacing service"
            );
            self.services().remove(&name);
            existing.shutdown();
            self.unregister_service(&name);
        }

        let endpoint = Arc::new(ServiceEndpoint::new(
            &name,
            descriptor,
            &self.inner.identity.caller_id,
            erase::<S, F>(handler),
        ));
        self.services().insert(name.clone(), endpoint.clone());

        let service_api = self.service_api();
        let identity = &self.inner.identity;
        match self.inner.master.register_service(
            &identity.caller_id,
            &name,
            &service_api,
            &identity.caller_api,
        ) {
            Ok(()) => {
                info!(service = %name, %service_api, "advertised service");
                Ok(ServiceServer::new(endpoint, self.clone()))
            }
            Err(err) => {
                self.services().remove(&name);
                endpoint.shutdown();
                Err(err.into())
            }
        }
    }

    /// Create a proxy for calling `service`.
    ///
    /// The provider is looked up and connected to immediately.  A single-use
    /// proxy looks it up again whenever it reconnects.
    pub fn service_proxy<S: ServiceType>(
        &self,
        service: &str,
        persistent: bool,
    ) -> Result<ServiceProxy<S>, ServiceError> {
        let name = self.inner.resolver.resolve(service);
        let _guard = self.registration();
        if self.is_shutdown() {
            return Err(ServiceError::ServiceClosed(name));
        }

        let master = self.inner.master.clone();
        let caller_id = self.inner.identity.caller_id.clone();
        let service_name = name.clone();
        let lookup: Lookup = Arc::new(move || {
            let uri = master.lookup_service(&caller_id, &service_name)?;
            Ok(resolve_service_uri(&uri)?)
        });
        let proxy = ServiceProxy::new(
            &name,
            &self.inner.identity.caller_id,
            persistent,
            self.inner.reactor.clone(),
            lookup,
        )
        .map_err(|err| match err {
            CallError::Master(err) => ServiceError::Master(err),
            CallError::Reactor(err) => ServiceError::Reactor(err),
            _ => ServiceError::ServiceClosed(name.clone()),
        })?;

        let mut proxies = self
            .inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        proxies.retain(|proxy| proxy.strong_count() > 0);
        proxies.push(proxy.downgrade());
        Ok(proxy)
    }

    /// Whether the master currently knows a provider for `service`
    pub fn lookup_service(&self, service: &str) -> Result<String, ServiceError> {
        let name = self.inner.resolver.resolve(service);
        Ok(self
            .inner
            .master
            .lookup_service(&self.inner.identity.caller_id, &name)?)
    }

    /// Run the handler on every queued request, returning how many were handled
    pub fn invoke_callbacks(&self) -> usize {
        let services: Vec<Arc<ServiceEndpoint>> = self.services().values().cloned().collect();
        services
            .iter()
            .map(|endpoint| endpoint.invoke_callbacks())
            .sum()
    }

    /// The live endpoint for `service`, if any
    pub fn service(&self, service: &str) -> Option<Arc<ServiceEndpoint>> {
        self.services().get(service).cloned()
    }

    /// Tear down `endpoint` if it is still the live entry for its name
    pub(crate) fn unadvertise_service(&self, endpoint: &Arc<ServiceEndpoint>) {
        let _guard = self.registration();
        let name = endpoint.name();
        let removed = {
            let mut services = self.services();
            match services.get(name) {
                Some(live) if Arc::ptr_eq(live, endpoint) => services.remove(name),
                _ => None,
            }
        };
        endpoint.shutdown();
        if removed.is_some() {
            self.unregister_service(name);
        }
    }

    fn unregister_service(&self, name: &str) {
        if let Err(err) = self.inner.master.unregister_service(
            &self.inner.identity.caller_id,
            name,
            &self.service_api(),
        ) {
            warn!(service = %name, "unable to unregister service: {err}");
        }
    }

    /// Shut down every service and proxy, stop the listener and unregister
    /// from the master.
    ///
    /// Unregistration failures are only logged.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.registration();

        let services: Vec<Arc<ServiceEndpoint>> =
            self.services().drain().map(|(_, endpoint)| endpoint).collect();
        let connections: Vec<_> = services
            .iter()
            .flat_map(|endpoint| endpoint.invalidate())
            .collect();
        let proxies = std::mem::take(
            &mut *self
                .inner
                .proxies
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for connection in connections {
            connection.close();
        }
        for proxy in proxies.iter().filter_map(Weak::upgrade) {
            proxy.terminate();
        }
        self.inner.reactor.stop_listener(&self.inner.listener);

        for endpoint in services.iter() {
            self.unregister_service(endpoint.name());
        }
        info!("service manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        io::{Read, Write},
        net::TcpStream,
        thread,
        time::Duration,
    };

    use tcpros_core::{RpcClient, RpcResponse, RpcValue};
    use tcpros_reactor::Reactor;
    use tcpros_wire::{header, ConnectionHeader, HeaderDecoder};

    use crate::proxy::ProxyState;

    struct Double;

    impl ServiceType for Double {
        const TYPE: &'static str = "test_srvs/Double";
        const MD5SUM: &'static str = "4a842b65f413084dc2b10fb484ea7f17";
        type Request = u32;
        type Response = u32;
    }

    struct Halve;

    impl ServiceType for Halve {
        const TYPE: &'static str = "test_srvs/Halve";
        const MD5SUM: &'static str = "b3a4a0c09d4e8b7ec8e2d4fa1b0c9d11";
        type Request = u32;
        type Response = u32;
    }

    /// A master remembering the single registered service
    #[derive(Default)]
    struct FakeMaster {
        calls: Mutex<Vec<String>>,
        service_api: Mutex<Option<String>>,
    }

    impl RpcClient for FakeMaster {
        fn call(
            &self,
            _: &str,
            method: &str,
            args: Vec<RpcValue>,
        ) -> Result<RpcResponse, MasterError> {
            self.calls.lock().unwrap().push(method.to_string());
            Ok(match method {
                "registerService" => {
                    *self.service_api.lock().unwrap() = args[2].as_str().map(String::from);
                    RpcResponse::success("", RpcValue::Int(1))
                }
                "unregisterService" => {
                    *self.service_api.lock().unwrap() = None;
                    RpcResponse::success("", RpcValue::Int(1))
                }
                "lookupService" => match self.service_api.lock().unwrap().clone() {
                    Some(uri) => RpcResponse::success("", uri),
                    None => RpcResponse::error("no provider"),
                },
                _ => RpcResponse::error("unexpected"),
            })
        }
    }

    fn manager(master: Arc<FakeMaster>, reactor: &Reactor) -> ServiceManager {
        ServiceManager::new(
            NodeIdentity {
                caller_id: "/node".into(),
                caller_api: "http://127.0.0.1:11312/".into(),
                host: "127.0.0.1".into(),
            },
            MasterProxy::new("http://master:11311/", master),
            reactor.handle(),
            Arc::new(|name: &str| name.to_string()),
        )
        .unwrap()
    }

    /// Call `proxy` on another thread while this one spins the manager
    fn call_while_spinning(
        services: &ServiceManager,
        proxy: &Arc<ServiceProxy<Double>>,
        request: u32,
    ) -> Result<u32, CallError> {
        let caller = {
            let proxy = proxy.clone();
            thread::spawn(move || proxy.call(&request))
        };
        while !caller.is_finished() {
            services.invoke_callbacks();
            thread::sleep(Duration::from_millis(1));
        }
        caller.join().unwrap()
    }

    #[test]
    fn test_round_trip_through_manager() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master.clone(), &reactor);

        let server = services
            .advertise_service::<Double, _>("/double", |value| match value {
                0 => Err("zero is not allowed".into()),
                13 => panic!("unlucky"),
                value => Ok(value * 2),
            })
            .unwrap();
        assert_eq!(
            master.service_api.lock().unwrap().clone(),
            Some(services.service_api())
        );

        let proxy = Arc::new(services.service_proxy::<Double>("/double", true).unwrap());
        assert!(proxy.wait_for_connection(Some(Duration::from_secs(5))));

        assert_eq!(call_while_spinning(&services, &proxy, 21).unwrap(), 42);
        assert!(matches!(
            call_while_spinning(&services, &proxy, 0),
            Err(CallError::Remote(message)) if message == "zero is not allowed"
        ));
        assert!(matches!(
            call_while_spinning(&services, &proxy, 13),
            Err(CallError::Remote(message)) if message == crate::endpoint::CALLBACK_FAILED
        ));
        assert_eq!(proxy.state(), ProxyState::Ready);
        assert_eq!(call_while_spinning(&services, &proxy, 4).unwrap(), 8);

        server.shutdown();
        assert!(!server.is_valid());
        assert!(services.service("/double").is_none());
    }

    #[test]
    fn test_single_use_proxy_reconnects_per_call() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master, &reactor);
        let _server = services
            .advertise_service::<Double, _>("/double", |value| Ok(value * 2))
            .unwrap();

        let proxy = Arc::new(services.service_proxy::<Double>("/double", false).unwrap());
        for value in 1..4 {
            assert_eq!(call_while_spinning(&services, &proxy, value).unwrap(), value * 2);
            assert_eq!(proxy.state(), ProxyState::Retired);
        }
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master, &reactor);
        let _server = services
            .advertise_service::<Double, _>("/double", |value| Ok(value * 2))
            .unwrap();

        let proxy = Arc::new(services.service_proxy::<Halve>("/double", true).unwrap());
        assert!(!proxy.wait_for_connection(Some(Duration::from_secs(5))));
        assert!(matches!(
            proxy.call(&1),
            Err(CallError::Negotiation(message)) if message.contains("md5sums do not match")
        ));
    }

    #[test]
    fn test_missing_service_is_a_master_error() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master, &reactor);

        assert!(matches!(
            services.service_proxy::<Double>("/double", true),
            Err(ServiceError::Master(MasterError::Status { code: -1, .. }))
        ));
    }

    #[test]
    fn test_unknown_service_and_probe_headers() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master, &reactor);
        let _server = services
            .advertise_service::<Double, _>("/double", |value| Ok(value * 2))
            .unwrap();

        let exchange = |request: ConnectionHeader| {
            let mut stream = TcpStream::connect(("127.0.0.1", services.port())).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(&request.encode()).unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            let mut decoder = HeaderDecoder::new();
            decoder.decode(&received).unwrap();
            decoder.take_header().unwrap()
        };

        let reply = exchange(ConnectionHeader::new().with(header::SERVICE, "/missing"));
        assert_eq!(reply.get(header::ERROR), Some("service /missing not found"));

        let reply = exchange(
            ConnectionHeader::new()
                .with(header::SERVICE, "/double")
                .with(header::MD5SUM, "*")
                .with("probe", "1"),
        );
        assert_eq!(reply.get(header::TYPE), Some(Double::TYPE));
        assert_eq!(reply.get(header::ERROR), None);
    }

    #[test]
    fn test_readvertise_and_shutdown() {
        let master = Arc::new(FakeMaster::default());
        let reactor = Reactor::spawn().unwrap();
        let services = manager(master.clone(), &reactor);

        let first = services
            .advertise_service::<Double, _>("/svc", |value| Ok(value * 2))
            .unwrap();
        let second = services
            .advertise_service::<Double, _>("/svc", |value| Ok(value * 3))
            .unwrap();
        assert!(first.is_valid() && second.is_valid());

        let replaced = services
            .advertise_service::<Halve, _>("/svc", |value| Ok(value / 2))
            .unwrap();
        assert!(!first.is_valid());
        assert_eq!(services.service("/svc").unwrap().descriptor(), &Halve::descriptor());

        let proxy = services.service_proxy::<Halve>("/svc", true).unwrap();
        services.shutdown();
        assert!(!replaced.is_valid());
        assert!(!proxy.is_valid());
        assert!(matches!(proxy.call(&4), Err(_)));
        assert!(services
            .advertise_service::<Double, _>("/svc", |value| Ok(value))
            .is_err());
        assert_eq!(
            *master.calls.lock().unwrap(),
            vec![
                "registerService",
                "unregisterService",
                "registerService",
                "lookupService",
                "unregisterService"
            ]
        );
    }
}
