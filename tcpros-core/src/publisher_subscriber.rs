//!
//! Publisher -> Subscriber Communication
//!
//! Publishers push serialized messages to every subscriber connected
//! to their topic.  Subscribers never pull; incoming messages are queued
//! and handed to callbacks when the owning node is spun.
//!

/// The basic publisher trait that enables the publishing of data
/// to every connected subscriber.
pub trait Publisher {
    /// The data to be published by the publisher
    type Data;
    /// The error type from attempting to publish data
    type Error;

    /// Publish a piece of data to every connected subscriber.
    ///
    /// Note: publishing with no subscribers connected is not an error.
    fn publish(&self, data: &Self::Data) -> Result<(), Self::Error>;
}
