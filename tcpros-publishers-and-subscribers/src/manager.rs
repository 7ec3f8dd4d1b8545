//!
//! The per-node registry of publications and subscriptions.
//!
//! Every advertise, subscribe and teardown runs under one registration lock
//! so two concurrent registrations of the same name can never both leave
//! live state behind.  The reactor only ever takes the short-lived map lock
//! when it looks up a topic for an inbound subscriber.
//!

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tracing::{info, warn};

use tcpros_core::{
    master::TCPROS, MasterProxy, Message, MessageError, NameResolver, NodeIdentity, SlaveProxy,
    TopicTransport,
};
use tcpros_reactor::{ListenerHandle, Protocol, ReactorHandle};

use crate::{
    error::TopicError,
    handle::{Publisher, Subscriber},
    pub_topic::PubTopic,
    sub_topic::{Callback, SubTopic},
    tcp::{PublicationMap, PublisherInbound},
};

struct Inner {
    identity: NodeIdentity,
    tcp_nodelay: bool,
    master: MasterProxy,
    slave: SlaveProxy,
    reactor: ReactorHandle,
    resolver: Arc<dyn NameResolver>,
    listener: ListenerHandle,
    registration: Mutex<()>,
    publications: PublicationMap,
    subscriptions: Mutex<HashMap<String, Arc<SubTopic>>>,
    shut_down: AtomicBool,
}

/// Owns every topic of a node and the listener subscribers connect to
#[derive(Clone)]
pub struct TopicManager {
    inner: Arc<Inner>,
}

impl TopicManager {
    /// Create a new TopicManager and start its listener on an ephemeral port
    pub fn new(
        identity: NodeIdentity,
        master: MasterProxy,
        reactor: ReactorHandle,
        resolver: Arc<dyn NameResolver>,
    ) -> Result<Self, TopicError> {
        let publications: PublicationMap = Arc::new(Mutex::new(HashMap::new()));
        let factory_publications = publications.clone();
        let listener = reactor.listen("0.0.0.0:0", move || {
            Box::new(PublisherInbound::new(factory_publications.clone())) as Box<dyn Protocol>
        })?;
        info!(port = listener.port(), "topic listener started");

        Ok(Self {
            inner: Arc::new(Inner {
                slave: master.slave(),
                identity,
                tcp_nodelay: false,
                master,
                reactor,
                resolver,
                listener,
                registration: Mutex::new(()),
                publications,
                subscriptions: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Ask publishers to disable Nagle's algorithm on future subscriptions.
    ///
    /// Only takes effect before the manager is cloned.
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tcp_nodelay = tcp_nodelay;
        }
        self
    }

    fn registration(&self) -> MutexGuard<'_, ()> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publications(&self) -> MutexGuard<'_, HashMap<String, Arc<PubTopic>>> {
        self.inner
            .publications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Arc<SubTopic>>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_running(&self, name: &str) -> Result<(), TopicError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(TopicError::TopicClosed(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// The port remote subscribers connect to
    pub fn port(&self) -> u16 {
        self.inner.listener.port()
    }

    /// Advertise `topic`, returning a handle to publish on it.
    ///
    /// Advertising a topic that is already advertised with the same type
    /// shares the existing publication; advertising it with a different
    /// type tears the old one down first.
    pub fn advertise<M: Message>(
        &self,
        topic: &str,
        latching: bool,
    ) -> Result<Publisher<M>, TopicError> {
        let name = self.inner.resolver.resolve(topic);
        let descriptor = M::descriptor();
        let _guard = self.registration();
        self.ensure_running(&name)?;

        let existing = self.publications().get(&name).cloned();
        if let Some(existing) = existing {
            if existing.descriptor() == &descriptor && existing.is_valid() {
                return Ok(Publisher::new(existing, self.clone()));
            }
            info!(
                topic = %name,
                old = %existing.descriptor(),
                new = %descriptor,
                "replacing publication"
            );
            self.publications().remove(&name);
            existing.shutdown();
            self.unregister_publisher(&name);
        }

        let publication = Arc::new(PubTopic::new(
            &name,
            descriptor,
            &self.inner.identity.caller_id,
            latching,
        ));
        self.publications().insert(name.clone(), publication.clone());

        let identity = &self.inner.identity;
        match self.inner.master.register_publisher(
            &identity.caller_id,
            &name,
            &publication.descriptor().type_name,
            &identity.caller_api,
        ) {
            Ok(subscribers) => {
                info!(topic = %name, subscribers = subscribers.len(), "advertised topic");
                Ok(Publisher::new(publication, self.clone()))
            }
            Err(err) => {
                self.publications().remove(&name);
                publication.shutdown();
                Err(err.into())
            }
        }
    }

    /// Subscribe to `topic`, handing every decoded message to `callback`.
    ///
    /// Subscribing again to a topic with the same type adds the callback to
    /// the existing subscription.
    pub fn subscribe<M, F>(&self, topic: &str, callback: F) -> Result<Subscriber<M>, TopicError>
    where
        M: Message,
        F: Fn(M) + Send + Sync + 'static,
    {
        let name = self.inner.resolver.resolve(topic);
        let descriptor = M::descriptor();
        let callback: Callback = Arc::new(move |payload: &[u8]| -> Result<(), MessageError> {
            callback(M::deserialize(payload)?);
            Ok(())
        });

        let (subscription, publishers) = {
            let _guard = self.registration();
            self.ensure_running(&name)?;

            let existing = self.subscriptions().get(&name).cloned();
            if let Some(existing) = existing {
                if existing.descriptor() == &descriptor && existing.is_valid() {
                    existing.add_callback(callback);
                    return Ok(Subscriber::new(existing, self.clone()));
                }
                info!(
                topic = %name,
                old = %existing.descriptor(),
                new = %descriptor,
                "replacing subscription"
            );
                self.subscriptions().remove(&name);
                existing.shutdown();
                self.unregister_subscriber(&name);
            }

            let subscription = Arc::new(SubTopic::new(
                &name,
                descriptor,
                &self.inner.identity.caller_id,
                self.inner.tcp_nodelay,
            ));
            subscription.add_callback(callback);
            self.subscriptions().insert(name.clone(), subscription.clone());

            let identity = &self.inner.identity;
            match self.inner.master.register_subscriber(
                &identity.caller_id,
                &name,
                &subscription.descriptor().type_name,
                &identity.caller_api,
            ) {
                Ok(publishers) => (subscription, publishers),
                Err(err) => {
                    self.subscriptions().remove(&name);
                    subscription.shutdown();
                    return Err(err.into());
                }
            }
        };

        info!(topic = %name, publishers = publishers.len(), "subscribed to topic");
        subscription.reconcile(&publishers, &self.inner.slave, &self.inner.reactor)?;
        Ok(Subscriber::new(subscription, self.clone()))
    }

    /// Answer a peer's `requestTopic`, offering our listener if we publish
    /// `topic` and the peer speaks one of our protocols.
    pub fn request_topic(&self, topic: &str, protocols: &[String]) -> Option<TopicTransport> {
        if !self.publications().contains_key(topic) {
            return None;
        }
        protocols
            .iter()
            .any(|protocol| protocol == TCPROS)
            .then(|| TopicTransport {
                protocol: TCPROS.to_string(),
                host: self.inner.identity.host.clone(),
                port: self.port(),
            })
    }

    /// Reconcile the subscription to `topic` with the publishers the master
    /// currently knows about.
    pub fn publisher_update(&self, topic: &str, publishers: &[String]) -> Result<(), TopicError> {
        let subscription = self
            .subscriptions()
            .get(topic)
            .cloned()
            .ok_or_else(|| TopicError::TopicClosed(topic.to_string()))?;
        subscription.reconcile(publishers, &self.inner.slave, &self.inner.reactor)
    }

    /// Hand every queued message to its callback, returning how many were invoked
    pub fn invoke_callbacks(&self) -> usize {
        let subscriptions: Vec<Arc<SubTopic>> = self.subscriptions().values().cloned().collect();
        subscriptions
            .iter()
            .map(|subscription| subscription.invoke_callbacks())
            .sum()
    }

    /// The name and type of every advertised topic
    pub fn get_publications(&self) -> Vec<(String, String)> {
        self.publications()
            .values()
            .map(|topic| (topic.name().to_string(), topic.descriptor().type_name.clone()))
            .collect()
    }

    /// The name and type of every subscribed topic
    pub fn get_subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions()
            .values()
            .map(|topic| (topic.name().to_string(), topic.descriptor().type_name.clone()))
            .collect()
    }

    /// The live publication for `topic`, if any
    pub fn publication(&self, topic: &str) -> Option<Arc<PubTopic>> {
        self.publications().get(topic).cloned()
    }

    /// The live subscription to `topic`, if any
    pub fn subscription(&self, topic: &str) -> Option<Arc<SubTopic>> {
        self.subscriptions().get(topic).cloned()
    }

    /// Tear down `publication` if it is still the live entry for its name
    pub(crate) fn unadvertise(&self, publication: &Arc<PubTopic>) {
        let _guard = self.registration();
        let name = publication.name();
        let removed = {
            let mut publications = self.publications();
            match publications.get(name) {
                Some(live) if Arc::ptr_eq(live, publication) => publications.remove(name),
                _ => None,
            }
        };
        publication.shutdown();
        if removed.is_some() {
            self.unregister_publisher(name);
        }
    }

    /// Tear down `subscription` if it is still the live entry for its name
    pub(crate) fn unsubscribe(&self, subscription: &Arc<SubTopic>) {
        let _guard = self.registration();
        let name = subscription.name();
        let removed = {
            let mut subscriptions = self.subscriptions();
            match subscriptions.get(name) {
                Some(live) if Arc::ptr_eq(live, subscription) => subscriptions.remove(name),
                _ => None,
            }
        };
        subscription.shutdown();
        if removed.is_some() {
            self.unregister_subscriber(name);
        }
    }

    fn unregister_publisher(&self, name: &str) {
        let identity = &self.inner.identity;
        if let Err(err) =
            self.inner
                .master
                .unregister_publisher(&identity.caller_id, name, &identity.caller_api)
        {
            warn!(topic = %name, "unable to unregister publisher: {err}");
        }
    }

    fn unregister_subscriber(&self, name: &str) {
        let identity = &self.inner.identity;
        if let Err(err) =
            self.inner
                .master
                .unregister_subscriber(&identity.caller_id, name, &identity.caller_api)
        {
            warn!(topic = %name, "unable to unregister subscriber: {err}");
        }
    }

    /// Whether [`TopicManager::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Shut down every topic, stop the listener and unregister from the master.
    ///
    /// Every topic is invalidated before any connection is closed.
    /// Unregistration failures are only logged.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.registration();

        let publications: Vec<Arc<PubTopic>> =
            self.publications().drain().map(|(_, topic)| topic).collect();
        let subscriptions: Vec<Arc<SubTopic>> =
            self.subscriptions().drain().map(|(_, topic)| topic).collect();

        let mut connections = Vec::new();
        connections.extend(publications.iter().flat_map(|topic| topic.invalidate()));
        connections.extend(subscriptions.iter().flat_map(|topic| topic.invalidate()));
        for connection in connections {
            connection.close();
        }
        self.inner.reactor.stop_listener(&self.inner.listener);

        for publication in publications.iter() {
            self.unregister_publisher(publication.name());
        }
        for subscription in subscriptions.iter() {
            self.unregister_subscriber(subscription.name());
        }
        info!("topic manager shut down");
    }
}
