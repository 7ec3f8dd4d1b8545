//!
//! The abstract RPC transport used to reach the master and peer nodes.
//!
//! Every remote method in the graph answers with a `(code, message, value)`
//! triple where a code of 1 signals success.  The encoding on the wire
//! (typically XML-RPC over HTTP) lives outside of this crate behind the
//! [`RpcClient`] trait.
//!

use crate::error::MasterError;

/// The status code of a successful call
pub const SUCCESS: i32 = 1;
/// The status code for a call the remote side could not satisfy
pub const FAILURE: i32 = 0;
/// The status code for a call that was malformed
pub const ERROR: i32 = -1;

/// A dynamically typed RPC argument or return value
#[derive(Clone, Debug, PartialEq)]
pub enum RpcValue {
    /// A 32-bit integer
    Int(i32),
    /// A boolean
    Bool(bool),
    /// A string
    Str(String),
    /// A double
    Double(f64),
    /// A heterogeneous list of values
    Array(Vec<RpcValue>),
}

impl RpcValue {
    /// Borrow the value as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Read the value as an integer
    pub fn as_int(&self) -> Option<i32> {
        match self {
            RpcValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the value as a list
    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Read the value as a list of strings, failing if any entry is not a string
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_array()?
            .iter()
            .map(|value| value.as_str().map(String::from))
            .collect()
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::Str(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::Str(value)
    }
}

impl From<i32> for RpcValue {
    fn from(value: i32) -> Self {
        RpcValue::Int(value)
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl<T: Into<RpcValue>> From<Vec<T>> for RpcValue {
    fn from(values: Vec<T>) -> Self {
        RpcValue::Array(values.into_iter().map(Into::into).collect())
    }
}

/// The `(code, message, value)` triple every graph RPC method answers with
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResponse {
    /// The status code, 1 on success
    pub code: i32,
    /// A human readable status message
    pub message: String,
    /// The method specific return value
    pub value: RpcValue,
}

impl RpcResponse {
    /// Create a successful response
    pub fn success(message: impl Into<String>, value: impl Into<RpcValue>) -> Self {
        Self {
            code: SUCCESS,
            message: message.into(),
            value: value.into(),
        }
    }

    /// Create a failed response with an ignored value
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: FAILURE,
            message: message.into(),
            value: RpcValue::Int(0),
        }
    }

    /// Create an error response with an ignored value
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ERROR,
            message: message.into(),
            value: RpcValue::Int(0),
        }
    }

    /// Convert a non-success status into a [`MasterError`] and hand back the value
    pub fn into_result(self) -> Result<RpcValue, MasterError> {
        if self.code == SUCCESS {
            Ok(self.value)
        } else {
            Err(MasterError::Status {
                code: self.code,
                message: self.message,
            })
        }
    }
}

/// A client able to invoke a named method on the RPC server at `uri`.
///
/// Implementations are expected to be cheap to share between threads; the
/// transport calls them from whichever thread registers or reconciles a
/// topic, never from the reactor.
pub trait RpcClient: Send + Sync {
    /// Call `method` on the server at `uri` with the positional `args`
    fn call(
        &self,
        uri: &str,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcResponse, MasterError>;
}

/// Split an `http://host:port/` or `rosrpc://host:port` uri into its host and port
pub fn parse_uri(uri: &str) -> Result<(String, u16), MasterError> {
    let invalid = || MasterError::InvalidUri(uri.to_string());
    let (_, rest) = uri.split_once("://").ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}
