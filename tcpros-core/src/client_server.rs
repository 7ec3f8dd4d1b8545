//!
//! TCPROS Client Server Traits.
//!
//! Servers are a single unique entity per service name that can have many
//! clients requesting something from them.
//!

/// A common abstraction for all service clients that send a request and
/// block until the matching response arrives.
pub trait Client {
    /// The type of data used as a request by the client
    type Request;
    /// The type of data used as a response from the server
    type Response;
    /// The type of error from sending or receiving data from
    /// the server
    type Error;

    /// Send a request to the server this client is associated with and
    /// wait for its response
    fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error>;
}
