//! Async CoAP (RFC 7252) client with support for observing resources (RFC 7641).

pub use client::CoapClient;
pub use config::ClientConfig;
pub use dispatch::Dispatch;
pub use error::ClientError;
pub use handler::{channel, ChannelSink, ResponseSink};
pub use link::WebLink;
pub use options::{names, Properties, PropertyValue};
pub use request::{OutboundMessage, Payload};
pub use response::{CoapResponse, Outcome};
pub use transport::{ExchangeHandler, ObserveRelation, Transport, TransportError};
pub use udp::{TransmissionParameters, UdpTransport};
pub use uri::{CoapUri, ResourceTarget};

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod link;
pub mod media_type;
pub mod observe;
pub mod options;
pub mod relations;
pub mod request;
pub mod response;
pub mod transport;
pub mod udp;
pub mod uri;

#[cfg(test)]
mod testing;
