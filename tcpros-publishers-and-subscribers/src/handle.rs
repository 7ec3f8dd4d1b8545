//!
//! Typed handles returned by [`TopicManager`].
//!

use std::{marker::PhantomData, sync::Arc};

use tcpros_core::Message;

use crate::{error::TopicError, manager::TopicManager, pub_topic::PubTopic, sub_topic::SubTopic};

/// A typed handle for publishing on an advertised topic.
///
/// Handles for the same topic share one publication, so shutting one down
/// shuts down every other handle too.
pub struct Publisher<M: Message> {
    topic: Arc<PubTopic>,
    manager: TopicManager,
    phantom: PhantomData<fn(M)>,
}

impl<M: Message> Publisher<M> {
    pub(crate) fn new(topic: Arc<PubTopic>, manager: TopicManager) -> Self {
        Self {
            topic,
            manager,
            phantom: PhantomData,
        }
    }

    /// Publish `message` to every connected subscriber
    pub fn publish(&self, message: &M) -> Result<(), TopicError> {
        self.topic.publish(message)
    }

    /// The number of subscribers currently connected
    pub fn num_subscribers(&self) -> usize {
        self.topic.num_connections()
    }

    /// Whether the publication is still live
    pub fn is_valid(&self) -> bool {
        self.topic.is_valid()
    }

    /// The resolved topic name
    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    /// Close every subscriber connection and unregister the publication
    pub fn shutdown(&self) {
        self.manager.unadvertise(&self.topic);
    }
}

impl<M: Message> tcpros_core::Publisher for Publisher<M> {
    type Data = M;
    type Error = TopicError;

    fn publish(&self, data: &Self::Data) -> Result<(), Self::Error> {
        self.topic.publish(data)
    }
}

/// A typed handle on a subscription
pub struct Subscriber<M: Message> {
    topic: Arc<SubTopic>,
    manager: TopicManager,
    phantom: PhantomData<fn() -> M>,
}

impl<M: Message> Subscriber<M> {
    pub(crate) fn new(topic: Arc<SubTopic>, manager: TopicManager) -> Self {
        Self {
            topic,
            manager,
            phantom: PhantomData,
        }
    }

    /// The number of publishers we completed negotiation with
    pub fn num_publishers(&self) -> usize {
        self.topic.num_publishers()
    }

    /// Whether the subscription is still live
    pub fn is_valid(&self) -> bool {
        self.topic.is_valid()
    }

    /// The resolved topic name
    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    /// Close every publisher connection and unregister the subscription
    pub fn shutdown(&self) {
        self.manager.unsubscribe(&self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use tcpros_core::{
        MasterError, MasterProxy, NodeIdentity, RpcClient, RpcResponse, RpcValue,
    };
    use tcpros_reactor::Reactor;

    struct Accepting(Mutex<Vec<String>>);

    impl RpcClient for Accepting {
        fn call(
            &self,
            _: &str,
            method: &str,
            _: Vec<RpcValue>,
        ) -> Result<RpcResponse, MasterError> {
            self.0.lock().unwrap().push(method.to_string());
            Ok(RpcResponse::success("", Vec::<String>::new()))
        }
    }

    fn manager(master: Arc<Accepting>, reactor: &Reactor) -> TopicManager {
        TopicManager::new(
            NodeIdentity {
                caller_id: "/node".into(),
                caller_api: "http://127.0.0.1:11312/".into(),
                host: "127.0.0.1".into(),
            },
            MasterProxy::new("http://master:11311/", master),
            reactor.handle(),
            Arc::new(|name: &str| format!("/ns/{name}")),
        )
        .unwrap()
    }

    #[test]
    fn test_publisher_shutdown_unregisters_once() {
        let master = Arc::new(Accepting(Mutex::new(Vec::new())));
        let reactor = Reactor::spawn().unwrap();
        let topics = manager(master.clone(), &reactor);

        let publisher = topics.advertise::<String>("chatter", false).unwrap();
        let other = topics.advertise::<String>("chatter", false).unwrap();
        assert_eq!(publisher.topic(), "/ns/chatter");
        tcpros_core::Publisher::publish(&publisher, &"hi".to_string()).unwrap();

        publisher.shutdown();
        other.shutdown();
        assert!(!other.is_valid());
        assert!(other.publish(&"hi".to_string()).is_err());
        assert_eq!(
            *master.0.lock().unwrap(),
            vec!["registerPublisher", "unregisterPublisher"]
        );
    }

    #[test]
    fn test_subscribing_twice_shares_the_subscription() {
        let master = Arc::new(Accepting(Mutex::new(Vec::new())));
        let reactor = Reactor::spawn().unwrap();
        let topics = manager(master.clone(), &reactor);

        let first = topics.subscribe::<String, _>("chatter", |_| {}).unwrap();
        let second = topics.subscribe::<String, _>("chatter", |_| {}).unwrap();
        assert_eq!(first.topic(), second.topic());
        assert_eq!(topics.get_subscriptions().len(), 1);

        second.shutdown();
        assert!(!first.is_valid());
        assert_eq!(
            *master.0.lock().unwrap(),
            vec!["registerSubscriber", "unregisterSubscriber"]
        );
    }
}
