//!
//! A Singular Unit of Work.
//!
//! A TCPROS node owns a reactor and the topic and service managers that
//! share it.  Sockets are serviced on the reactor, while user callbacks are
//! only ever invoked when the node is updated from the caller's thread.
//!

/// How a node identifies itself to the master and its peers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    /// The fully qualified node name sent as `callerid`
    pub caller_id: String,
    /// The uri of the node's own RPC server
    pub caller_api: String,
    /// The host peers should use to reach the node's listeners
    pub host: String,
}

/// A Node represents a singular process participating in the graph that
/// can be driven by any scheduler able to call `update` periodically.
pub trait Node: Send {
    /// Return the node's update rate (in us)
    fn get_update_delay_us(&self) -> u128;

    /// Complete the necessary setup functionalities for a Node.
    fn start(&mut self);

    /// Update is called every get_update_delay_us microseconds.
    ///
    /// For a TCPROS node this drains the queued messages and service
    /// requests into their user callbacks.
    fn update(&mut self);

    /// Tear down every registration and connection owned by the node.
    fn shutdown(&mut self);
}
