use coap_lite::{CoapOption, MessageClass, Packet, RequestType};

use crate::media_type;
use crate::options::{self, names, Properties, PropertyValue};
use crate::request::method_name;

/// Whether an exchange produced a response at all.  An empty payload is still a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response { code: String, payload: Vec<u8> },
    /// Timed out, rejected with Reset, or otherwise went unanswered.
    NoResponse,
}

/// Canonical, transport independent form of the result of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapResponse {
    request_method: RequestType,
    request_uri: String,
    outcome: Outcome,
    success: bool,
    properties: Properties,
    media_type: Option<&'static str>,
}

impl CoapResponse {
    pub fn request_method(&self) -> RequestType {
        self.request_method
    }

    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self.outcome, Outcome::NoResponse)
    }

    /// Textual response code such as `2.05`.
    pub fn code(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Response { code, .. } => Some(code),
            Outcome::NoResponse => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.outcome {
            Outcome::Response { payload, .. } => Some(payload),
            Outcome::NoResponse => None,
        }
    }

    pub fn payload_text(&self) -> Option<String> {
        self.payload()
            .map(|payload| String::from_utf8_lossy(payload).into_owned())
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// MIME type matching the response's content format, if it carried a known one.
    pub fn media_type(&self) -> Option<&'static str> {
        self.media_type
    }
}

/// Convert the raw result of an exchange.  `None` stands for "no response".
pub fn convert(response: Option<&Packet>, request_method: RequestType, request_uri: &str) -> CoapResponse {
    let mut properties = Properties::new();
    properties.insert(
        names::REQUEST_CODE.to_string(),
        PropertyValue::from(method_name(request_method)),
    );
    properties.insert(
        names::REQUEST_URI.to_string(),
        PropertyValue::from(request_uri),
    );

    let (outcome, success, media_type) = match response {
        Some(packet) => {
            let code = code_string(packet.header.code);
            let success = is_success_code(packet.header.code);
            properties.insert(names::RESPONSE_CODE.to_string(), PropertyValue::from(code.as_str()));
            options::fill_properties(packet, &mut properties);
            let media_type = options::content_format(packet).and_then(media_type::mime_type_for);
            let outcome = Outcome::Response {
                code,
                payload: packet.payload.clone(),
            };
            (outcome, success, media_type)
        }
        None => (Outcome::NoResponse, false, None),
    };
    properties.insert(
        names::RESPONSE_SUCCESS.to_string(),
        PropertyValue::Bool(success),
    );

    CoapResponse {
        request_method,
        request_uri: request_uri.to_string(),
        outcome,
        success,
        properties,
        media_type,
    }
}

pub fn code_string(code: MessageClass) -> String {
    let raw = u8::from(code);
    format!("{}.{:02}", raw >> 5, raw & 0x1f)
}

pub fn is_success_code(code: MessageClass) -> bool {
    matches!(code, MessageClass::Response(_)) && u8::from(code) >> 5 == 2
}

/// Whether a response to an observe registration ends the relation: the server either failed
/// the request or answered it without the Observe option (RFC 7641 section 3.2).
pub fn ends_observation(packet: &Packet) -> bool {
    !is_success_code(packet.header.code) || packet.get_option(CoapOption::Observe).is_none()
}
