use std::sync::Arc;

use coap_lite::{Packet, RequestType};
use log::debug;

use crate::error::ClientError;
use crate::handler::{deliver_isolated, HandlerRegistry, ResponseSink};
use crate::request::{method_name, Request};
use crate::response::{convert, CoapResponse};
use crate::transport::{ExchangeHandler, Transport};

/// Result of [`Dispatcher::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    Completed(CoapResponse),
    /// The response will be delivered to the named handler.
    InFlight,
}

/// Sends built requests, either waiting for the response or handing it to a named handler
/// once it arrives.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            transport,
            handlers,
        }
    }

    pub async fn dispatch(
        &self,
        request: Request,
        handler_name: Option<&str>,
    ) -> Result<Dispatch, ClientError> {
        match handler_name {
            None => self.send(request).await.map(Dispatch::Completed),
            Some(name) => {
                self.send_async(request, name)?;
                Ok(Dispatch::InFlight)
            }
        }
    }

    /// Wait for the response.  A request that goes unanswered yields a
    /// [`crate::Outcome::NoResponse`] response rather than an error.
    pub async fn send(&self, request: Request) -> Result<CoapResponse, ClientError> {
        let method = request.method();
        let uri = request.uri().to_string();
        debug!("Sending {} {uri}", method_name(method));
        let response = self
            .transport
            .send(request)
            .await
            .map_err(ClientError::Dispatch)?;
        Ok(convert(response.as_ref(), method, &uri))
    }

    /// Start the exchange and return immediately.  The handler is looked up before anything is
    /// sent.
    pub fn send_async(&self, request: Request, handler_name: &str) -> Result<(), ClientError> {
        let sink = self.handlers.lookup(handler_name)?;
        let forwarder = ResponseForwarder {
            handler_name: handler_name.to_string(),
            sink,
            method: request.method(),
            uri: request.uri().to_string(),
        };
        debug!(
            "Sending {} {} for handler {handler_name}",
            method_name(forwarder.method),
            forwarder.uri
        );
        self.transport
            .send_async(request, Arc::new(forwarder))
            .map_err(ClientError::Dispatch)
    }
}

/// Converts the outcome of one asynchronous exchange and hands it to a sink.
struct ResponseForwarder {
    handler_name: String,
    sink: Arc<dyn ResponseSink>,
    method: RequestType,
    uri: String,
}

impl ExchangeHandler for ResponseForwarder {
    fn on_load(&self, response: Packet) {
        let response = convert(Some(&response), self.method, &self.uri);
        deliver_isolated(&self.handler_name, self.sink.as_ref(), response);
    }

    fn on_error(&self) {
        let response = convert(None, self.method, &self.uri);
        deliver_isolated(&self.handler_name, self.sink.as_ref(), response);
    }
}
