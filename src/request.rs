use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};

use crate::error::ClientError;
use crate::media_type;
use crate::options::{self, Properties, PropertyValue};
use crate::uri::CoapUri;

/// Observe option value of a registration (RFC 7641 section 2).
pub const OBSERVE_REGISTER: u64 = 0;
/// Observe option value of a deregistration.
pub const OBSERVE_DEREGISTER: u64 = 1;

/// Body of an outbound message.  [`Payload::Empty`] sends no payload at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Empty => Vec::new(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Text(text) => text.as_bytes().to_vec(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

/// The message a caller hands to an operation: a payload, outbound properties and optionally
/// the MIME type of the payload.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    payload: Payload,
    properties: Properties,
    mime_type: Option<String>,
}

impl OutboundMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn set_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn set_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn set_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
}

/// A request ready for dispatch.  The packet carries everything except the message ID and
/// token, which the transport assigns per exchange.
#[derive(Debug, Clone)]
pub struct Request {
    method: RequestType,
    confirmable: bool,
    uri: CoapUri,
    message: Packet,
}

impl Request {
    pub fn method(&self) -> RequestType {
        self.method
    }

    pub fn is_confirmable(&self) -> bool {
        self.confirmable
    }

    pub fn uri(&self) -> &CoapUri {
        &self.uri
    }

    pub fn message(&self) -> &Packet {
        &self.message
    }

    pub fn into_message(self) -> Packet {
        self.message
    }

    /// Copy of this request carrying the given Observe option value.
    pub fn with_observe(&self, value: u64) -> Request {
        let mut request = self.clone();
        options::set_uint_option(&mut request.message, CoapOption::Observe, value);
        request
    }

    pub fn registration(&self) -> Request {
        self.with_observe(OBSERVE_REGISTER)
    }

    pub fn deregistration(&self) -> Request {
        self.with_observe(OBSERVE_DEREGISTER)
    }
}

/// Translate a payload and its properties into a request for `uri`.  No I/O takes place.
///
/// A content format set explicitly through the `coap.opt.content_format` property wins over
/// the one inferred from `mime_type`.
pub fn build_request(
    method: RequestType,
    confirmable: bool,
    uri: CoapUri,
    payload: &Payload,
    properties: &Properties,
    mime_type: Option<&str>,
) -> Result<Request, ClientError> {
    let mut message = Packet::new();
    message.header.set_type(if confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    message.header.code = MessageClass::Request(method);

    for segment in uri.path_segments() {
        message.add_option(CoapOption::UriPath, segment.into_bytes());
    }
    for param in uri.query_params() {
        message.add_option(CoapOption::UriQuery, param.into_bytes());
    }

    options::apply_properties(&mut message, properties)?;

    if let Some(mime_type) = mime_type {
        if options::content_format(&message).is_none() {
            match media_type::content_format_for(mime_type) {
                Some(format) => options::set_uint_option(
                    &mut message,
                    CoapOption::ContentFormat,
                    u64::from(format),
                ),
                None => log::debug!("No content format registered for {mime_type}"),
            }
        }
    }

    message.payload = payload.to_bytes();

    Ok(Request {
        method,
        confirmable,
        uri,
        message,
    })
}

pub fn method_name(method: RequestType) -> &'static str {
    match method {
        RequestType::Get => "GET",
        RequestType::Post => "POST",
        RequestType::Put => "PUT",
        RequestType::Delete => "DELETE",
        _ => "UNKNOWN",
    }
}
