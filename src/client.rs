use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use coap_lite::RequestType;
use log::{debug, info};

use crate::config::ClientConfig;
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::ClientError;
use crate::handler::{HandlerRegistry, ResponseSink};
use crate::link::{parse_link_format, WebLink};
use crate::observe::ObserveController;
use crate::options::Properties;
use crate::relations::{RelationKind, RelationRegistry};
use crate::request::{build_request, OutboundMessage, Payload, Request};
use crate::response::{CoapResponse, Outcome};
use crate::transport::Transport;
use crate::udp::UdpTransport;
use crate::uri::{build_uri, build_uri_from_parts, query_string, ResourceTarget};

/// Path of the CoRE resource directory of a server (RFC 6690).
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// CoAP client endpoint: synchronous and asynchronous requests, named response handlers and
/// observe relations, all sharing one transport.
///
/// ```no_run
/// use coap_client::{ClientConfig, CoapClient, OutboundMessage, ResourceTarget};
///
/// # async fn demo() -> Result<(), coap_client::ClientError> {
/// let client = CoapClient::start(ClientConfig::new("127.0.0.1")).await?;
/// let response = client
///     .get(true, &ResourceTarget::new("/basic/get_me"), &OutboundMessage::new())
///     .await?;
/// println!("{:?}: {:?}", response.code(), response.payload_text());
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct CoapClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    static_relations: Arc<RelationRegistry>,
    dynamic_relations: Arc<RelationRegistry>,
    dispatcher: Dispatcher,
    observer: ObserveController,
    running: AtomicBool,
}

impl CoapClient {
    /// Bind the default UDP transport to the configured local address.
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        if config.is_secure() {
            return Err(ClientError::SecureTransportUnavailable);
        }
        let transport = UdpTransport::bind(&config)
            .await
            .map_err(ClientError::Endpoint)?;
        info!(
            "CoAP client started on {} for {}",
            transport.local_addr(),
            config.host()
        );
        Ok(Self::with_transport(config, transport))
    }

    /// Use a custom transport, for example one speaking DTLS for `coaps`.
    pub fn with_transport(config: ClientConfig, transport: impl Transport + 'static) -> Self {
        Self::with_shared_transport(config, Arc::new(transport))
    }

    pub fn with_shared_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        Self {
            dispatcher: Dispatcher::new(transport.clone(), handlers.clone()),
            observer: ObserveController::new(transport.clone(), handlers.clone()),
            config,
            transport,
            handlers,
            static_relations: Arc::new(RelationRegistry::new(RelationKind::Static)),
            dynamic_relations: Arc::new(RelationRegistry::new(RelationKind::Dynamic)),
            running: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Proactively cancel every observe relation, forget all handlers and release the
    /// transport.  Calling it again does nothing.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.static_relations.clear();
        self.dynamic_relations.clear();
        self.handlers.clear();
        self.transport.shutdown().await;
        info!("CoAP client for {} stopped", self.config.host());
    }

    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ClientError::NotRunning)
        }
    }

    /// Canonical URI of `target`, as used to key observe relations.
    pub fn uri(&self, target: &ResourceTarget) -> Result<String, ClientError> {
        build_uri(&self.config, target).map(|uri| uri.to_string())
    }

    /// Ping the configured host, failing with [`ClientError::Unreachable`] if it does not
    /// answer.
    pub async fn test_connectivity(&self) -> Result<(), ClientError> {
        if self.ping(None, None).await? {
            Ok(())
        } else {
            let uri = build_uri_from_parts(&self.config, None, None, "/", None)?;
            Err(ClientError::Unreachable(uri.to_string()))
        }
    }

    pub async fn ping(&self, host: Option<&str>, port: Option<u16>) -> Result<bool, ClientError> {
        self.ensure_running()?;
        let uri = build_uri_from_parts(&self.config, host, port, "/", None)?;
        debug!("Pinging {uri}");
        self.transport
            .ping(&uri)
            .await
            .map_err(ClientError::Dispatch)
    }

    /// Retrieve the server's `/.well-known/core`.  An unanswered or unsuccessful request yields
    /// no links.
    pub async fn discover(
        &self,
        confirmable: bool,
        host: Option<&str>,
        port: Option<u16>,
        query: Option<&[String]>,
    ) -> Result<Vec<WebLink>, ClientError> {
        self.ensure_running()?;
        let uri = build_uri_from_parts(
            &self.config,
            host,
            port,
            WELL_KNOWN_CORE,
            query_string(query).as_deref(),
        )?;
        let request = build_request(
            RequestType::Get,
            confirmable,
            uri,
            &Payload::Empty,
            &Properties::new(),
            None,
        )?;
        let response = self.dispatcher.send(request).await?;
        match response.outcome() {
            Outcome::Response { payload, .. } if response.is_success() => {
                Ok(parse_link_format(&String::from_utf8_lossy(payload)))
            }
            outcome => {
                debug!("Discovery on {} failed: {outcome:?}", response.request_uri());
                Ok(Vec::new())
            }
        }
    }

    pub async fn get(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<CoapResponse, ClientError> {
        self.send(RequestType::Get, confirmable, target, message).await
    }

    pub async fn put(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<CoapResponse, ClientError> {
        self.send(RequestType::Put, confirmable, target, message).await
    }

    pub async fn post(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<CoapResponse, ClientError> {
        self.send(RequestType::Post, confirmable, target, message).await
    }

    pub async fn delete(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<CoapResponse, ClientError> {
        self.send(RequestType::Delete, confirmable, target, message).await
    }

    async fn send(
        &self,
        method: RequestType,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<CoapResponse, ClientError> {
        let request = self.build(method, confirmable, target, message)?;
        self.dispatcher.send(request).await
    }

    /// Send a GET and deliver its response, or its absence, to the named handler.
    pub fn async_get(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        self.send_async(RequestType::Get, confirmable, target, message, handler_name)
    }

    pub fn async_put(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        self.send_async(RequestType::Put, confirmable, target, message, handler_name)
    }

    pub fn async_post(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        self.send_async(RequestType::Post, confirmable, target, message, handler_name)
    }

    pub fn async_delete(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        self.send_async(RequestType::Delete, confirmable, target, message, handler_name)
    }

    fn send_async(
        &self,
        method: RequestType,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        let request = self.build(method, confirmable, target, message)?;
        self.dispatcher.send_async(request, handler_name)
    }

    /// Generic form of the request operations: waits for the response when `handler_name` is
    /// `None`, otherwise hands it to that handler.
    pub async fn request(
        &self,
        method: RequestType,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
        handler_name: Option<&str>,
    ) -> Result<Dispatch, ClientError> {
        let request = self.build(method, confirmable, target, message)?;
        self.dispatcher.dispatch(request, handler_name).await
    }

    /// Observe `target`, delivering its notifications to the named handler.  Replaces any
    /// relation previously started on the same URI.
    pub fn start_observe(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        handler_name: &str,
    ) -> Result<(), ClientError> {
        let request = self.observe_request(confirmable, target)?;
        self.observer
            .start_observe(request, handler_name, &self.dynamic_relations)
    }

    /// Returns whether a relation was stopped.
    pub fn stop_observe(&self, target: &ResourceTarget) -> Result<bool, ClientError> {
        let uri = self.uri(target)?;
        Ok(self.observer.stop_observe(&uri, &self.dynamic_relations))
    }

    pub fn list_observations(&self) -> Vec<String> {
        self.observer.list_observations(&self.dynamic_relations)
    }

    /// Observe `target` on behalf of a long-lived subscription source.  These relations live in
    /// their own namespace and end with [`Self::stop_source_observe`] or [`Self::stop`].
    pub fn observe(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<(), ClientError> {
        let request = self.observe_request(confirmable, target)?;
        self.observer
            .start_observe_source(request, sink, &self.static_relations)
    }

    pub fn stop_source_observe(&self, target: &ResourceTarget) -> Result<bool, ClientError> {
        let uri = self.uri(target)?;
        Ok(self.observer.stop_observe(&uri, &self.static_relations))
    }

    pub fn list_source_observations(&self) -> Vec<String> {
        self.observer.list_observations(&self.static_relations)
    }

    pub fn register_handler(
        &self,
        name: &str,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<(), ClientError> {
        self.ensure_running()?;
        self.handlers.register(name, sink)
    }

    fn observe_request(
        &self,
        confirmable: bool,
        target: &ResourceTarget,
    ) -> Result<Request, ClientError> {
        self.build(RequestType::Get, confirmable, target, &OutboundMessage::new())
    }

    fn build(
        &self,
        method: RequestType,
        confirmable: bool,
        target: &ResourceTarget,
        message: &OutboundMessage,
    ) -> Result<Request, ClientError> {
        self.ensure_running()?;
        let uri = build_uri(&self.config, target)?;
        build_request(
            method,
            confirmable,
            uri,
            message.payload(),
            message.properties(),
            message.mime_type(),
        )
    }
}
