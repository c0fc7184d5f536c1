use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced to callers of [`crate::CoapClient`].  Precondition failures (URI, handler,
/// properties) are always reported before any packet is sent.  Note that a request which simply
/// goes unanswered is not an error: see [`crate::response::Outcome::NoResponse`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The URI components could not be combined into a valid `coap` or `coaps` URI.
    #[error("cannot form valid uri using: {{ {0} }}")]
    MalformedUri(String),

    /// An async request or observe referenced a handler name that was never registered.
    #[error("referenced handler {{ {0} }} not found")]
    HandlerNotFound(String),

    #[error("response handler name {{ {0} }} not unique")]
    DuplicateHandler(String),

    #[error("empty response handler name not allowed")]
    InvalidHandlerName,

    /// An outbound property in the `coap.opt.` namespace could not be mapped to its option.
    #[error("invalid property {name}: {reason}")]
    InvalidProperty { name: String, reason: String },

    /// Unexpected transport fault while dispatching, for example a host that cannot be resolved.
    #[error("dispatch failed: {0}")]
    Dispatch(#[source] TransportError),

    #[error("coap ping failure on uri {{ {0} }}")]
    Unreachable(String),

    #[error("client is not running")]
    NotRunning,

    /// The configuration asks for `coaps` but no DTLS capable transport was supplied.
    #[error("secure endpoint requires a DTLS transport, see CoapClient::with_transport")]
    SecureTransportUnavailable,

    #[error("coap endpoint fault: {0}")]
    Endpoint(#[source] TransportError),
}

impl ClientError {
    pub(crate) fn invalid_property(name: &str, reason: impl ToString) -> Self {
        Self::InvalidProperty {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}
