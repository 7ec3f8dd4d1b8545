//!
//! Node configuration.
//!
//! A [`NodeConfig`] is either built up from a name and a master uri or read
//! from the usual `ROS_*` environment variables.
//!

use std::{env, time::Duration};

use thiserror::Error;

use tcpros_core::{rpc::parse_uri, Namespace};

/// The rate [`RosNode::spin`](crate::RosNode::spin) drains callbacks at by default
pub const DEFAULT_SPIN_RATE_HZ: u32 = 100;

/// The host advertised when neither `ROS_IP` nor `ROS_HOSTNAME` is set
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// An error in a node's configuration
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No master uri was given and `ROS_MASTER_URI` is unset
    #[error("ROS_MASTER_URI is not set")]
    MissingMasterUri,
    /// The node has no uri of its own for peers to call
    #[error("node {0} has no node uri")]
    MissingNodeUri(String),
    /// A uri could not be split into a host and a port
    #[error("invalid uri {0:?}")]
    InvalidUri(String),
    /// The node name is empty
    #[error("node name must not be empty")]
    EmptyName,
    /// The spin rate is zero
    #[error("spin rate must be positive")]
    ZeroSpinRate,
}

/// Everything a [`RosNode`](crate::RosNode) needs to join the graph
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    name: String,
    namespace: String,
    master_uri: String,
    host: String,
    node_uri: Option<String>,
    tcp_nodelay: bool,
    spin_rate_hz: u32,
    remappings: Vec<(String, String)>,
}

impl NodeConfig {
    /// Create a configuration for the node `name` talking to the master at `master_uri`
    pub fn new(name: impl Into<String>, master_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "/".to_string(),
            master_uri: master_uri.into(),
            host: DEFAULT_HOST.to_string(),
            node_uri: None,
            tcp_nodelay: false,
            spin_rate_hz: DEFAULT_SPIN_RATE_HZ,
            remappings: Vec::new(),
        }
    }

    /// Read the configuration of the node `name` from the environment.
    ///
    /// `ROS_MASTER_URI` is required.  The advertised host comes from
    /// `ROS_IP`, then `ROS_HOSTNAME`, then falls back to the loopback
    /// address.  `ROS_NAMESPACE` is honored when set.
    pub fn from_env(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(name, |key| env::var(key).ok())
    }

    fn from_lookup(
        name: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let set = |key: &str| lookup(key).filter(|value| !value.is_empty());
        let master_uri = set("ROS_MASTER_URI").ok_or(ConfigError::MissingMasterUri)?;
        let mut config = Self::new(name, master_uri);
        if let Some(host) = set("ROS_IP").or_else(|| set("ROS_HOSTNAME")) {
            config.host = host;
        }
        if let Some(namespace) = set("ROS_NAMESPACE") {
            config.namespace = namespace;
        }
        Ok(config)
    }

    /// Place the node in `namespace`
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Advertise `host` to peers instead of the loopback address
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the uri of the RPC server answering for this node
    pub fn with_node_uri(mut self, node_uri: impl Into<String>) -> Self {
        self.node_uri = Some(node_uri.into());
        self
    }

    /// Ask publishers to disable Nagle's algorithm on subscriber connections
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// Set the rate `spin` drains callbacks at
    pub fn with_spin_rate(mut self, hz: u32) -> Self {
        self.spin_rate_hz = hz;
        self
    }

    /// Remap the name `from` onto `to`
    pub fn with_remapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.remappings.push((from.into(), to.into()));
        self
    }

    /// The node name as given
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace the node lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The master's uri
    pub fn master_uri(&self) -> &str {
        &self.master_uri
    }

    /// The host advertised to peers
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The node's own RPC uri, if set
    pub fn node_uri(&self) -> Option<&str> {
        self.node_uri.as_deref()
    }

    /// Whether subscriptions ask for `tcp_nodelay`
    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    /// The configured spin rate
    pub fn spin_rate_hz(&self) -> u32 {
        self.spin_rate_hz
    }

    /// The time between two iterations of `spin`
    pub fn spin_period(&self) -> Duration {
        Duration::from_secs(1) / self.spin_rate_hz.max(1)
    }

    /// Build the name resolver for this node
    pub fn resolver(&self) -> Namespace {
        self.remappings
            .iter()
            .fold(Namespace::new(&self.namespace, &self.name), |resolver, (from, to)| {
                resolver.with_remapping(from, to)
            })
    }

    /// Check the configuration is complete enough to start a node
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.spin_rate_hz == 0 {
            return Err(ConfigError::ZeroSpinRate);
        }
        parse_uri(&self.master_uri)
            .map_err(|_| ConfigError::InvalidUri(self.master_uri.clone()))?;
        let node_uri = self
            .node_uri
            .as_deref()
            .ok_or_else(|| ConfigError::MissingNodeUri(self.name.clone()))?;
        parse_uri(node_uri).map_err(|_| ConfigError::InvalidUri(node_uri.to_string()))?;
        Ok(())
    }
}
