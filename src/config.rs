use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::udp::TransmissionParameters;

/// Endpoint configuration, created once when the client starts and read-only thereafter.
///
/// ```
/// use coap_client::ClientConfig;
///
/// let config = ClientConfig::new("127.0.0.1")
///     .set_port(5683)
///     .set_bind_port(0)
///     .enable_message_log();
/// assert_eq!(config.host(), "127.0.0.1");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    host: String,
    port: Option<u16>,
    secure: bool,
    bind_host: Option<IpAddr>,
    bind_port: Option<u16>,
    log_messages: bool,
    transmission: TransmissionParameters,
}

impl ClientConfig {
    /// Default host that requests are sent to when an operation does not override it.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            secure: false,
            bind_host: None,
            bind_port: None,
            log_messages: false,
            transmission: TransmissionParameters::default(),
        }
    }

    /// Default server port.  When unset, 5683 (`coap`) or 5684 (`coaps`) applies.
    pub fn set_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use the `coaps` scheme.  Requires a DTLS transport, see
    /// [`crate::CoapClient::with_transport`].
    pub fn enable_secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn set_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = Some(host);
        self
    }

    pub fn set_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    /// Log every packet sent or received at `info` level rather than `trace`.
    pub fn enable_message_log(mut self) -> Self {
        self.log_messages = true;
        self
    }

    pub fn set_transmission_parameters(mut self, parameters: TransmissionParameters) -> Self {
        self.transmission = parameters;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn log_messages(&self) -> bool {
        self.log_messages
    }

    pub fn transmission_parameters(&self) -> TransmissionParameters {
        self.transmission
    }

    /// Address the local endpoint binds to; an ephemeral port on all interfaces by default.
    pub fn local_address(&self) -> SocketAddr {
        let host = self
            .bind_host
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(host, self.bind_port.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use crate::config::ClientConfig;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("example.com");
        assert_eq!(config.port(), None);
        assert!(!config.is_secure());
        assert!(!config.log_messages());
        assert_eq!(
            config.local_address(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        );
    }

    #[test]
    fn test_local_address() {
        let config = ClientConfig::new("example.com")
            .set_bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .set_bind_port(15683);
        assert_eq!(config.local_address(), "127.0.0.1:15683".parse().unwrap());
    }
}
