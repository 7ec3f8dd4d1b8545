//!
//! TCPROS Clients and Servers
//!
//! A server is a [`ServiceEndpoint`] accepting any number of client
//! connections.  Requests are queued on the reactor and only handed to the
//! user's handler when the node calls [`ServiceManager::invoke_callbacks`].
//!
//! A client is a [`ServiceProxy`] whose `call` blocks the calling thread
//! until the reactor delivers the response.
//!

#![deny(unsafe_code)]
#![deny(missing_docs)]

pub mod error;
pub use error::{CallError, ServiceError};

pub mod endpoint;
pub use endpoint::{Handler, ServiceEndpoint, ServiceServer};

pub mod proxy;
pub use proxy::{ProxyMonitor, ProxyState, ServiceProxy};

pub mod tcp;
pub use tcp::{ServiceInbound, ServiceOutbound};

pub mod manager;
pub use manager::ServiceManager;
