//!
//! TCPROS Publishers and Subscribers
//!
//! A publisher owns a [`PubTopic`] holding every subscriber connection for
//! its topic, while a subscriber owns a [`SubTopic`] holding one outbound
//! connection per publisher the master told it about.  Frames received on
//! the reactor are queued on the [`SubTopic`] and only decoded and handed
//! to callbacks when the node calls [`TopicManager::invoke_callbacks`].
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub use error::TopicError;

pub mod pub_topic;
pub use pub_topic::PubTopic;

pub mod sub_topic;
pub use sub_topic::{Callback, SubTopic};

pub mod tcp;
pub use tcp::{PublisherInbound, SubscriberOutbound};

pub mod manager;
pub use manager::TopicManager;

pub mod handle;
pub use handle::{Publisher, Subscriber};
