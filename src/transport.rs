use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use coap_lite::error::MessageError;
use coap_lite::Packet;

use crate::request::Request;
use crate::uri::CoapUri;

/// Generalization of the underlying CoAP transport: message layer, retransmission, DTLS and so
/// on.  The client core only ever talks to the network through this trait, which makes it
/// straightforward to plug in a secure transport or an in-memory one for testing.  The default
/// RFC 7252 implementation is [`crate::udp::UdpTransport`].
///
/// Implementations must never invoke an [`ExchangeHandler`] from within the call that registered
/// it (`send_async` or `observe`); callbacks are expected to arrive later from the transport's own
/// tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and wait for its response.  `Ok(None)` means that no response will
    /// arrive, either because the exchange timed out or because the peer rejected it.
    async fn send(&self, request: Request) -> Result<Option<Packet>, TransportError>;

    /// Start the exchange without waiting.  Exactly one of `on_load` or `on_error` is invoked
    /// once the exchange resolves.
    fn send_async(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<(), TransportError>;

    /// Register an observe relation (RFC 7641) for the request's target.  Every notification is
    /// delivered to `handler` in the order it arrived.
    fn observe(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Arc<dyn ObserveRelation>, TransportError>;

    /// CoAP "ping": an empty Confirmable message that a live endpoint answers with Reset.
    async fn ping(&self, uri: &CoapUri) -> Result<bool, TransportError>;

    /// Release the endpoint.  Outstanding exchanges resolve as "no response".
    async fn shutdown(&self);
}

/// Callback for exchanges started with [`Transport::send_async`] or [`Transport::observe`].
pub trait ExchangeHandler: Send + Sync {
    fn on_load(&self, response: Packet);

    /// The exchange failed or timed out without a response.
    fn on_error(&self);
}

/// Transport side handle of a single observe relation.
pub trait ObserveRelation: Send + Sync + Debug {
    /// Actively tell the server that we are no longer interested, as opposed to letting the
    /// relation silently lapse.  Notifications arriving after this call are dropped.
    fn proactive_cancel(&self);

    fn is_canceled(&self) -> bool;

    /// Re-send the registration for the same relation (RFC 7641 section 3.3.1).
    fn reregister(&self);
}

/// Generalized errors indicating a range of transport-related issues such as being unable to bind,
/// unresolvable hosts, malformed input, etc.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("generic I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("packet was malformed: {0:?}")]
    MalformedPacket(MessageError),

    #[error("cannot resolve host {{ {0} }}")]
    Unresolvable(String),

    #[error("transport is shut down")]
    Shutdown,

    #[error("unspecified: {0}")]
    Unspecified(String),
}

impl From<MessageError> for TransportError {
    fn from(x: MessageError) -> Self {
        Self::MalformedPacket(x)
    }
}

impl fmt::Debug for dyn ExchangeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExchangeHandler")
    }
}
