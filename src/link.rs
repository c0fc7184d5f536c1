use std::collections::BTreeMap;

use coap_lite::link_format::{
    LinkFormatParser, LINK_ATTR_CONTENT_FORMAT, LINK_ATTR_OBSERVABLE, LINK_ATTR_RESOURCE_TYPE,
};
use log::warn;

const LINK_ATTR_TITLE: &str = "title";

/// One resource advertised by a server's `/.well-known/core`.  Attributes are kept as the raw
/// strings the server sent; an attribute may appear more than once and valueless attributes
/// such as `obs` map to an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebLink {
    uri: String,
    attributes: BTreeMap<String, Vec<String>>,
}

impl WebLink {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn attributes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.attributes
    }

    /// First value of the attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attribute_values(key).first().map(String::as_str)
    }

    pub fn attribute_values(&self, key: &str) -> &[String] {
        self.attributes.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn is_observable(&self) -> bool {
        self.attributes.contains_key(LINK_ATTR_OBSERVABLE)
    }

    pub fn content_types(&self) -> Vec<u16> {
        self.space_separated(LINK_ATTR_CONTENT_FORMAT)
            .filter_map(|ct| ct.parse().ok())
            .collect()
    }

    pub fn resource_types(&self) -> Vec<&str> {
        self.space_separated(LINK_ATTR_RESOURCE_TYPE).collect()
    }

    pub fn title(&self) -> Option<&str> {
        self.attribute(LINK_ATTR_TITLE)
    }

    fn space_separated<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.attribute_values(key)
            .iter()
            .flat_map(|value| value.split_whitespace())
    }
}

/// Parse a CoRE link-format (RFC 6690) document.  Parsing stops at the first malformed link;
/// the links before it are still returned.
pub fn parse_link_format(document: &str) -> Vec<WebLink> {
    let mut links = Vec::new();
    for entry in LinkFormatParser::new(document) {
        match entry {
            Ok((uri, attributes)) => {
                let mut link = WebLink::new(uri);
                for (key, value) in attributes {
                    link.add_attribute(key, value.to_string());
                }
                links.push(link);
            }
            Err(e) => {
                warn!("Malformed link-format document: {e:?}");
                break;
            }
        }
    }
    links
}
