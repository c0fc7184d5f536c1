use std::fmt;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::config::ClientConfig;
use crate::error::ClientError;

pub const COAP_URI_SCHEME: &str = "coap";
pub const COAP_SECURE_URI_SCHEME: &str = "coaps";
pub const DEFAULT_COAP_PORT: u16 = 5683;
pub const DEFAULT_COAP_SECURE_PORT: u16 = 5684;

/// Characters that a URL parser would silently treat as the start of another component.
const HOST_DELIMITERS: &[char] = &['/', '?', '#', '@', ' '];

/// Absolute `coap` or `coaps` URI.  Its string form is canonical and used as the key of the
/// observe relation registries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoapUri {
    url: Url,
}

/// The resource an operation addresses.  `host` and `port` override the configured defaults for
/// this call only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTarget {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<Vec<String>>,
}

impl ResourceTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn set_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn set_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Append a query parameter, used verbatim (typically `key=value`).
    pub fn add_query_param(mut self, param: impl Into<String>) -> Self {
        self.query.get_or_insert_with(Vec::new).push(param.into());
        self
    }

    pub(crate) fn query_string(&self) -> Option<String> {
        query_string(self.query.as_deref())
    }
}

impl CoapUri {
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let url = Url::parse(input).map_err(|e| ClientError::MalformedUri(format!("{input}: {e}")))?;
        match url.scheme() {
            COAP_URI_SCHEME | COAP_SECURE_URI_SCHEME => {}
            other => {
                return Err(ClientError::MalformedUri(format!(
                    "{input}: unsupported scheme {other}"
                )))
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ClientError::MalformedUri(format!("{input}: missing host")));
        }
        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == COAP_SECURE_URI_SCHEME
    }

    /// Host suitable for name resolution, that is without IPv6 brackets.
    pub fn host(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(if self.is_secure() {
            DEFAULT_COAP_SECURE_PORT
        } else {
            DEFAULT_COAP_PORT
        })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Decoded, non-empty path segments, one per Uri-Path option.
    pub fn path_segments(&self) -> Vec<String> {
        self.url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .map(decode)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decoded query parameters, one per Uri-Query option.
    pub fn query_params(&self) -> Vec<String> {
        self.url
            .query()
            .map(|query| {
                query
                    .split('&')
                    .filter(|param| !param.is_empty())
                    .map(decode)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for CoapUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Join query parameters with `&`, each taken verbatim.  Absent and empty lists both yield no
/// query at all.
pub fn query_string(params: Option<&[String]>) -> Option<String> {
    match params {
        Some(params) if !params.is_empty() => Some(params.join("&")),
        _ => None,
    }
}

/// Build the URI for `target`, falling back to the configured host and port.
pub fn build_uri(config: &ClientConfig, target: &ResourceTarget) -> Result<CoapUri, ClientError> {
    build_uri_from_parts(
        config,
        target.host.as_deref(),
        target.port,
        &target.path,
        target.query_string().as_deref(),
    )
}

pub fn build_uri_from_parts(
    config: &ClientConfig,
    host: Option<&str>,
    port: Option<u16>,
    path: &str,
    query: Option<&str>,
) -> Result<CoapUri, ClientError> {
    let malformed = || {
        ClientError::MalformedUri(format!("{host:?}, {port:?}, {path}, {query:?}"))
    };

    let secure = config.is_secure();
    let scheme = if secure {
        COAP_SECURE_URI_SCHEME
    } else {
        COAP_URI_SCHEME
    };
    let uri_host = host.unwrap_or_else(|| config.host());
    let uri_port = port.or_else(|| config.port()).unwrap_or(if secure {
        DEFAULT_COAP_SECURE_PORT
    } else {
        DEFAULT_COAP_PORT
    });

    if uri_host.is_empty() || uri_host.contains(HOST_DELIMITERS) {
        return Err(malformed());
    }
    if !path.is_empty() && !path.starts_with('/') {
        return Err(malformed());
    }

    let authority = if uri_host.contains(':') && !uri_host.starts_with('[') {
        format!("[{uri_host}]")
    } else {
        uri_host.to_string()
    };
    let mut url = Url::parse(&format!("{scheme}://{authority}:{uri_port}")).map_err(|_| malformed())?;
    if url.host_str().map_or(true, str::is_empty) || url.port() != Some(uri_port) {
        return Err(malformed());
    }
    url.set_path(path);
    url.set_query(query.filter(|q| !q.is_empty()));

    Ok(CoapUri { url })
}
