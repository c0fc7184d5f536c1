//! Conversion between flat, named message properties and CoAP options.
//!
//! Outbound, every property in the `coap.opt.` namespace becomes one or more options of the
//! request.  Inbound, every option of a response is exposed as a property, with options this
//! crate has no name for surfacing as `coap.opt.other.<number>`.

use std::collections::{BTreeMap, LinkedList};

use coap_lite::{CoapOption, Packet};
use log::warn;

use crate::error::ClientError;

pub type Properties = BTreeMap<String, PropertyValue>;

pub mod names {
    pub const REQUEST_CODE: &str = "coap.request.code";
    pub const REQUEST_URI: &str = "coap.request.uri";
    pub const RESPONSE_SUCCESS: &str = "coap.response.success";
    pub const RESPONSE_CODE: &str = "coap.response.code";

    pub const OPTION_PREFIX: &str = "coap.opt.";
    pub const OTHER_OPTION_PREFIX: &str = "coap.opt.other.";

    pub const IF_MATCH_LIST: &str = "coap.opt.if_match.list";
    pub const URI_HOST: &str = "coap.opt.uri_host";
    pub const ETAG_LIST: &str = "coap.opt.etag.list";
    pub const IF_NONE_MATCH: &str = "coap.opt.if_none_match";
    pub const OBSERVE: &str = "coap.opt.observe";
    pub const URI_PORT: &str = "coap.opt.uri_port";
    pub const LOCATION_PATH: &str = "coap.opt.location_path";
    pub const URI_PATH: &str = "coap.opt.uri_path";
    pub const CONTENT_FORMAT: &str = "coap.opt.content_format";
    pub const MAX_AGE: &str = "coap.opt.max_age";
    pub const URI_QUERY_LIST: &str = "coap.opt.uri_query.list";
    pub const ACCEPT: &str = "coap.opt.accept";
    pub const LOCATION_QUERY: &str = "coap.opt.location_query";
    pub const BLOCK2: &str = "coap.opt.block2";
    pub const BLOCK1: &str = "coap.opt.block1";
    pub const SIZE2: &str = "coap.opt.size2";
    pub const PROXY_URI: &str = "coap.opt.proxy_uri";
    pub const PROXY_SCHEME: &str = "coap.opt.proxy_scheme";
    pub const SIZE1: &str = "coap.opt.size1";
}

/// Value of a single message property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Int(u64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Scalars behave as a list of one.
    fn items(&self) -> Vec<&PropertyValue> {
        match self {
            Self::List(items) => items.iter().collect(),
            scalar => vec![scalar],
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u32> for PropertyValue {
    fn from(n: u32) -> Self {
        Self::Int(u64::from(n))
    }
}

impl From<u64> for PropertyValue {
    fn from(n: u64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(items: Vec<PropertyValue>) -> Self {
        Self::List(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Opaque,
    Uint,
    Text,
    Empty,
    /// Repeated text option exposed as one string, e.g. Location-Path as `a/b/c`.
    Joined(char),
}

struct OptionSpec {
    option: CoapOption,
    name: &'static str,
    format: Format,
    repeatable: bool,
    /// Whether the option may be set from outbound properties.  Uri-Path always comes from the
    /// request URI.
    outbound: bool,
}

const SPECS: &[OptionSpec] = &[
    OptionSpec {
        option: CoapOption::IfMatch,
        name: names::IF_MATCH_LIST,
        format: Format::Opaque,
        repeatable: true,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::UriHost,
        name: names::URI_HOST,
        format: Format::Text,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::ETag,
        name: names::ETAG_LIST,
        format: Format::Opaque,
        repeatable: true,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::IfNoneMatch,
        name: names::IF_NONE_MATCH,
        format: Format::Empty,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Observe,
        name: names::OBSERVE,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::UriPort,
        name: names::URI_PORT,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::LocationPath,
        name: names::LOCATION_PATH,
        format: Format::Joined('/'),
        repeatable: true,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::UriPath,
        name: names::URI_PATH,
        format: Format::Joined('/'),
        repeatable: true,
        outbound: false,
    },
    OptionSpec {
        option: CoapOption::ContentFormat,
        name: names::CONTENT_FORMAT,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::MaxAge,
        name: names::MAX_AGE,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::UriQuery,
        name: names::URI_QUERY_LIST,
        format: Format::Text,
        repeatable: true,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Accept,
        name: names::ACCEPT,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::LocationQuery,
        name: names::LOCATION_QUERY,
        format: Format::Joined('&'),
        repeatable: true,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Block2,
        name: names::BLOCK2,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Block1,
        name: names::BLOCK1,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Size2,
        name: names::SIZE2,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::ProxyUri,
        name: names::PROXY_URI,
        format: Format::Text,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::ProxyScheme,
        name: names::PROXY_SCHEME,
        format: Format::Text,
        repeatable: false,
        outbound: true,
    },
    OptionSpec {
        option: CoapOption::Size1,
        name: names::SIZE1,
        format: Format::Uint,
        repeatable: false,
        outbound: true,
    },
];

impl OptionSpec {
    fn for_name(name: &str) -> Option<&'static OptionSpec> {
        SPECS.iter().find(|spec| spec.name == name)
    }

    fn for_number(number: u16) -> Option<&'static OptionSpec> {
        SPECS.iter().find(|spec| u16::from(spec.option) == number)
    }

    fn encode(&self, value: &PropertyValue) -> Result<Vec<Vec<u8>>, ClientError> {
        let mut encoded = Vec::new();
        for item in value.items() {
            match (self.format, item) {
                (Format::Opaque, PropertyValue::Bytes(b)) => encoded.push(b.clone()),
                (Format::Opaque, PropertyValue::Text(s)) => encoded.push(s.as_bytes().to_vec()),
                (Format::Uint, PropertyValue::Int(n)) => encoded.push(encode_uint(*n)),
                (Format::Uint, PropertyValue::Text(s)) => {
                    let n = s
                        .trim()
                        .parse::<u64>()
                        .map_err(|e| ClientError::invalid_property(self.name, e))?;
                    encoded.push(encode_uint(n));
                }
                (Format::Text, PropertyValue::Text(s)) => encoded.push(s.as_bytes().to_vec()),
                (Format::Empty, PropertyValue::Bool(true)) => encoded.push(Vec::new()),
                (Format::Empty, PropertyValue::Bool(false)) => {}
                (Format::Empty, PropertyValue::Text(s)) => match s.trim() {
                    "true" => encoded.push(Vec::new()),
                    "false" => {}
                    other => {
                        return Err(ClientError::invalid_property(
                            self.name,
                            format!("expected a boolean, got {other:?}"),
                        ))
                    }
                },
                (Format::Joined(separator), PropertyValue::Text(s)) => encoded.extend(
                    s.split(separator)
                        .filter(|part| !part.is_empty())
                        .map(|part| part.as_bytes().to_vec()),
                ),
                (format, other) => {
                    return Err(ClientError::invalid_property(
                        self.name,
                        format!("{other:?} cannot be used as {format:?} option value"),
                    ))
                }
            }
        }
        if !self.repeatable && encoded.len() > 1 {
            return Err(ClientError::invalid_property(
                self.name,
                "option cannot be repeated",
            ));
        }
        Ok(encoded)
    }

    fn decode(&self, values: &LinkedList<Vec<u8>>) -> Option<PropertyValue> {
        let first = values.front()?;
        let value = match self.format {
            Format::Opaque if self.repeatable => PropertyValue::List(
                values.iter().cloned().map(PropertyValue::Bytes).collect(),
            ),
            Format::Opaque => PropertyValue::Bytes(first.clone()),
            Format::Text if self.repeatable => PropertyValue::List(
                values
                    .iter()
                    .map(|v| PropertyValue::Text(String::from_utf8_lossy(v).into_owned()))
                    .collect(),
            ),
            Format::Text => PropertyValue::Text(String::from_utf8_lossy(first).into_owned()),
            Format::Uint => PropertyValue::Int(decode_uint(first)),
            Format::Empty => PropertyValue::Bool(true),
            Format::Joined(separator) => PropertyValue::Text(
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect::<Vec<_>>()
                    .join(&separator.to_string()),
            ),
        };
        Some(value)
    }
}

/// Map outbound properties onto the options of `packet`.  Properties outside the `coap.opt.`
/// namespace are not options and are skipped.
pub fn apply_properties(packet: &mut Packet, properties: &Properties) -> Result<(), ClientError> {
    for (name, value) in properties {
        if let Some(number) = name.strip_prefix(names::OTHER_OPTION_PREFIX) {
            let number = number
                .parse::<u16>()
                .map_err(|_| ClientError::invalid_property(name, "not an option number"))?;
            for item in value.items() {
                let encoded = match item {
                    PropertyValue::Bytes(b) => b.clone(),
                    PropertyValue::Text(s) => s.as_bytes().to_vec(),
                    PropertyValue::Int(n) => encode_uint(*n),
                    other => {
                        return Err(ClientError::invalid_property(
                            name,
                            format!("{other:?} cannot be used as option value"),
                        ))
                    }
                };
                packet.add_option(CoapOption::from(number), encoded);
            }
            continue;
        }
        if !name.starts_with(names::OPTION_PREFIX) {
            continue;
        }
        match OptionSpec::for_name(name) {
            Some(spec) if spec.outbound => {
                for encoded in spec.encode(value)? {
                    packet.add_option(spec.option, encoded);
                }
            }
            _ => warn!("Ignoring unsupported outbound option property {name}"),
        }
    }
    Ok(())
}

/// Expose every option of `packet` as a property.
pub fn fill_properties(packet: &Packet, properties: &mut Properties) {
    for (number, values) in packet.options() {
        let number = match u16::try_from(*number) {
            Ok(number) => number,
            Err(_) => continue,
        };
        match OptionSpec::for_number(number) {
            Some(spec) => {
                if let Some(value) = spec.decode(values) {
                    properties.insert(spec.name.to_string(), value);
                }
            }
            None => {
                let mut items: Vec<_> = values.iter().cloned().map(PropertyValue::Bytes).collect();
                let value = if items.len() == 1 {
                    items.remove(0)
                } else {
                    PropertyValue::List(items)
                };
                properties.insert(format!("{}{number}", names::OTHER_OPTION_PREFIX), value);
            }
        }
    }
}

pub fn content_format(packet: &Packet) -> Option<u16> {
    packet
        .get_option(CoapOption::ContentFormat)
        .and_then(|values| values.front())
        .and_then(|value| u16::try_from(decode_uint(value)).ok())
}

pub fn set_uint_option(packet: &mut Packet, option: CoapOption, value: u64) {
    packet.clear_option(option);
    packet.add_option(option, encode_uint(value));
}

/// Minimal big-endian encoding of a `uint` option value; zero encodes as no bytes at all.
pub fn encode_uint(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let leading = bytes.iter().take_while(|b| **b == 0).count();
    bytes[leading..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
