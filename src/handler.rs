use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, error};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ClientError;
use crate::response::CoapResponse;

/// Consumer of converted responses, for asynchronous requests and observe notifications alike.
/// Deliveries for one observe relation arrive in notification order, possibly from a
/// different task than the one that registered the sink.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, response: CoapResponse) -> anyhow::Result<()>;
}

impl<F> ResponseSink for F
where
    F: Fn(CoapResponse) -> anyhow::Result<()> + Send + Sync,
{
    fn deliver(&self, response: CoapResponse) -> anyhow::Result<()> {
        self(response)
    }
}

/// Sink half of [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelSink(UnboundedSender<CoapResponse>);

impl ResponseSink for ChannelSink {
    fn deliver(&self, response: CoapResponse) -> anyhow::Result<()> {
        self.0
            .send(response)
            .map_err(|_| anyhow::anyhow!("response receiver dropped"))
    }
}

/// Sink that forwards every delivery into a stream.
pub fn channel() -> (ChannelSink, UnboundedReceiverStream<CoapResponse>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink(tx), UnboundedReceiverStream::new(rx))
}

/// Hand `response` to `sink`.  A failing or panicking sink is logged and otherwise ignored so
/// that later deliveries are unaffected.
pub(crate) fn deliver_isolated(label: &str, sink: &dyn ResponseSink, response: CoapResponse) {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(response))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Handler {label} failed to process response: {e:?}"),
        Err(_) => error!("Handler {label} panicked while processing response"),
    }
}

/// Named response sinks.  Names are unique; a handler cannot be replaced once registered.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ResponseSink>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, sink: Arc<dyn ResponseSink>) -> Result<(), ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidHandlerName);
        }
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            return Err(ClientError::DuplicateHandler(name.to_string()));
        }
        debug!("Registered response handler {name}");
        handlers.insert(name.to_string(), sink);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ResponseSink>, ClientError> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::HandlerNotFound(name.to_string()))
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
