use std::sync::{Arc, Mutex, PoisonError, Weak};

use coap_lite::Packet;
use log::{debug, warn};

use crate::error::ClientError;
use crate::handler::{deliver_isolated, HandlerRegistry, ResponseSink};
use crate::relations::{Recovery, RelationRegistry};
use crate::request::Request;
use crate::response::{convert, ends_observation};
use crate::transport::{ExchangeHandler, ObserveRelation, Transport, TransportError};

/// Creates, recovers and stops observe relations (RFC 7641) on behalf of the client.
pub struct ObserveController {
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
}

impl ObserveController {
    pub fn new(transport: Arc<dyn Transport>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            transport,
            handlers,
        }
    }

    /// Observe the request's target, delivering every notification to the named handler.  An
    /// existing relation for the same URI in `registry` is proactively canceled first.
    pub fn start_observe(
        &self,
        request: Request,
        handler_name: &str,
        registry: &Arc<RelationRegistry>,
    ) -> Result<(), ClientError> {
        let sink = self.handlers.lookup(handler_name)?;
        self.observe_with(request, handler_name.to_string(), sink, registry)
    }

    /// Like [`Self::start_observe`] but for a sink that is not registered by name.
    pub fn start_observe_source(
        &self,
        request: Request,
        sink: Arc<dyn ResponseSink>,
        registry: &Arc<RelationRegistry>,
    ) -> Result<(), ClientError> {
        let label = format!("source<{}>", request.uri());
        self.observe_with(request, label, sink, registry)
    }

    fn observe_with(
        &self,
        request: Request,
        label: String,
        sink: Arc<dyn ResponseSink>,
        registry: &Arc<RelationRegistry>,
    ) -> Result<(), ClientError> {
        let uri = request.uri().to_string();
        let forwarder = ObserveForwarder::new(
            label,
            sink,
            request.registration(),
            Arc::downgrade(&self.transport),
            Arc::downgrade(registry),
        );
        debug!("Starting {:?} observe relation on {uri}", registry.kind());
        registry
            .install(&uri, || forwarder.observe(self.transport.as_ref()))
            .map_err(ClientError::Dispatch)
    }

    /// Proactively cancel and forget the relation on `uri`.  Stopping a relation that does not
    /// exist does nothing.
    pub fn stop_observe(&self, uri: &str, registry: &RelationRegistry) -> bool {
        let stopped = registry.remove(uri, true);
        if stopped {
            debug!("Stopped {:?} observe relation on {uri}", registry.kind());
        } else {
            warn!("No {:?} observe relation on {uri} to stop", registry.kind());
        }
        stopped
    }

    pub fn list_observations(&self, registry: &RelationRegistry) -> Vec<String> {
        registry.list()
    }
}

/// Transport callback of a single relation.  Holds weak references back to the transport and
/// registry so that it can replace its own relation, and only acts on errors while its relation
/// is the one registered for the URI.
struct ObserveForwarder {
    label: String,
    sink: Arc<dyn ResponseSink>,
    registration: Request,
    uri: String,
    transport: Weak<dyn Transport>,
    registry: Weak<RelationRegistry>,
    relation: Mutex<Option<Weak<dyn ObserveRelation>>>,
}

impl ObserveForwarder {
    fn new(
        label: String,
        sink: Arc<dyn ResponseSink>,
        registration: Request,
        transport: Weak<dyn Transport>,
        registry: Weak<RelationRegistry>,
    ) -> Arc<Self> {
        let uri = registration.uri().to_string();
        Arc::new(Self {
            label,
            sink,
            registration,
            uri,
            transport,
            registry,
            relation: Mutex::new(None),
        })
    }

    /// Register a fresh relation for the same target, delivering to the same sink.
    fn observe(
        self: Arc<Self>,
        transport: &dyn Transport,
    ) -> Result<Arc<dyn ObserveRelation>, TransportError> {
        let handler: Arc<dyn ExchangeHandler> = self.clone();
        let relation = transport.observe(self.registration.clone(), handler)?;
        *self.relation.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::downgrade(&relation));
        Ok(relation)
    }

    fn reobserve(&self) -> Result<Arc<dyn ObserveRelation>, TransportError> {
        let transport = self.transport.upgrade().ok_or(TransportError::Shutdown)?;
        let successor = Self::new(
            self.label.clone(),
            self.sink.clone(),
            self.registration.clone(),
            self.transport.clone(),
            self.registry.clone(),
        );
        successor.observe(transport.as_ref())
    }

    fn owns(&self, relation: &Arc<dyn ObserveRelation>) -> bool {
        self.relation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |own| {
                Weak::as_ptr(own) as *const () == Arc::as_ptr(relation) as *const ()
            })
    }
}

impl ExchangeHandler for ObserveForwarder {
    fn on_load(&self, response: Packet) {
        if ends_observation(&response) {
            if let Some(registry) = self.registry.upgrade() {
                if registry.remove_if(&self.uri, |current| self.owns(current)) {
                    debug!("Observe relation on {} ended by server", self.uri);
                }
            }
        }
        let response = convert(Some(&response), self.registration.method(), &self.uri);
        deliver_isolated(&self.label, self.sink.as_ref(), response);
    }

    fn on_error(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let recovery = registry.recover(
                &self.uri,
                |current| self.owns(current),
                || self.reobserve(),
            );
            debug!("Observe relation on {} failed, recovery: {recovery:?}", self.uri);
            if matches!(recovery, Recovery::Absent | Recovery::Stale) {
                return;
            }
        }
        let response = convert(None, self.registration.method(), &self.uri);
        deliver_isolated(&self.label, self.sink.as_ref(), response);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coap_lite::{CoapOption, RequestType};
    use futures::StreamExt;

    use crate::error::ClientError;
    use crate::handler::{channel, HandlerRegistry};
    use crate::observe::ObserveController;
    use crate::options::{decode_uint, Properties};
    use crate::relations::{RelationKind, RelationRegistry};
    use crate::request::{build_request, Payload, Request};
    use crate::testing::{MockTransport, UNRESOLVABLE_HOST};
    use crate::transport::Transport;
    use crate::uri::CoapUri;

    const TEMPORARY: &str = "coap://127.0.0.1/observe/temporary";

    fn request(method: RequestType, uri: &str, payload: &str) -> Request {
        build_request(
            method,
            true,
            CoapUri::parse(uri).unwrap(),
            &Payload::from(payload),
            &Properties::new(),
            None,
        )
        .unwrap()
    }

    fn get(uri: &str) -> Request {
        request(RequestType::Get, uri, "")
    }

    struct Fixture {
        transport: Arc<MockTransport>,
        handlers: Arc<HandlerRegistry>,
        registry: Arc<RelationRegistry>,
        controller: ObserveController,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let controller = ObserveController::new(transport.clone(), handlers.clone());
        Fixture {
            transport,
            handlers,
            registry: Arc::new(RelationRegistry::new(RelationKind::Dynamic)),
            controller,
        }
    }

    #[tokio::test]
    async fn test_registration_carries_observe_zero() {
        let f = fixture();
        let (sink, mut stream) = channel();
        f.handlers.register("h", Arc::new(sink)).unwrap();
        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();

        let requests = f.transport.observe_requests();
        assert_eq!(requests.len(), 1);
        let observe = requests[0]
            .message()
            .get_option(CoapOption::Observe)
            .and_then(|values| values.front().cloned())
            .unwrap();
        assert_eq!(decode_uint(&observe), 0);

        let first = stream.next().await.unwrap();
        assert_eq!(first.payload_text().as_deref(), Some("nothing"));
        assert_eq!(f.controller.list_observations(&f.registry), vec![TEMPORARY]);
    }

    #[tokio::test]
    async fn test_restart_cancels_previous_relation_once() {
        let f = fixture();
        let (sink, _stream) = channel();
        f.handlers.register("h", Arc::new(sink)).unwrap();
        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();
        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();

        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[0].proactive_cancels(), 1);
        assert_eq!(relations[1].proactive_cancels(), 0);
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let f = fixture();
        let result = f.controller.start_observe(get(TEMPORARY), "nope", &f.registry);
        assert!(matches!(result, Err(ClientError::HandlerNotFound(_))));
        assert!(f.transport.observe_requests().is_empty());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let f = fixture();
        let (sink, _stream) = channel();
        let uri = format!("coap://{UNRESOLVABLE_HOST}/observe/temporary");
        let result = f
            .controller
            .start_observe_source(get(&uri), Arc::new(sink), &f.registry);
        assert!(matches!(result, Err(ClientError::Dispatch(_))));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_error_on_active_relation_reregisters() {
        let f = fixture();
        let (sink, mut stream) = channel();
        f.controller
            .start_observe_source(get(TEMPORARY), Arc::new(sink), &f.registry)
            .unwrap();
        assert!(!stream.next().await.unwrap().is_no_response());

        f.transport.fail_relation("/observe/temporary");
        let failure = stream.next().await.unwrap();
        assert!(failure.is_no_response());
        assert_eq!(failure.request_uri(), TEMPORARY);

        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].reregistrations(), 1);
    }

    #[tokio::test]
    async fn test_error_on_canceled_relation_replaces_it() {
        let f = fixture();
        let (sink, mut stream) = channel();
        f.controller
            .start_observe_source(get(TEMPORARY), Arc::new(sink), &f.registry)
            .unwrap();
        assert!(!stream.next().await.unwrap().is_no_response());

        f.transport.relations("/observe/temporary")[0].cancel_silently();
        f.transport.fail_relation("/observe/temporary");
        assert!(stream.next().await.unwrap().is_no_response());

        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[0].reregistrations(), 0);
        let current = f.registry.get(TEMPORARY).unwrap();
        assert!(!current.is_canceled());

        assert_eq!(
            stream.next().await.unwrap().payload_text().as_deref(),
            Some("nothing")
        );
    }

    #[tokio::test]
    async fn test_error_from_replaced_relation_is_ignored() {
        let f = fixture();
        let (sink, mut stream) = channel();
        f.handlers.register("h", Arc::new(sink)).unwrap();
        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();
        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();

        f.transport.fail_observer("/observe/temporary", 0);
        f.transport
            .send(request(RequestType::Put, TEMPORARY, "changed"))
            .await
            .unwrap();

        let payloads: Vec<_> = stream
            .by_ref()
            .take(3)
            .map(|response| response.payload_text())
            .collect()
            .await;
        assert_eq!(
            payloads,
            vec![
                Some("nothing".to_string()),
                Some("nothing".to_string()),
                Some("changed".to_string())
            ]
        );

        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[1].reregistrations(), 0);
        assert_eq!(relations[1].proactive_cancels(), 0);
        assert!(!f.registry.get(TEMPORARY).unwrap().is_canceled());
    }

    #[tokio::test]
    async fn test_relation_ended_by_server_is_forgotten() {
        let f = fixture();
        let (sink, mut stream) = channel();
        let uri = "coap://127.0.0.1/basic/get_me";
        f.controller
            .start_observe_source(get(uri), Arc::new(sink), &f.registry)
            .unwrap();
        assert_eq!(f.controller.list_observations(&f.registry), vec![uri]);

        let response = stream.next().await.unwrap();
        assert_eq!(response.code(), Some("4.04"));
        assert!(f.controller.list_observations(&f.registry).is_empty());

        let relations = f.transport.relations("/basic/get_me");
        assert_eq!(relations[0].proactive_cancels(), 0);
        assert_eq!(relations[0].reregistrations(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_observe_keeps_one_relation() {
        const TASKS: usize = 16;
        let f = Arc::new(fixture());
        let (sink, _stream) = channel();
        f.handlers.register("h", Arc::new(sink)).unwrap();

        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move {
                    f.controller
                        .start_observe(get(TEMPORARY), "h", &f.registry)
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(f.registry.len(), 1);
        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations.len(), TASKS);
        let canceled: usize = relations.iter().map(|r| r.proactive_cancels()).sum();
        assert_eq!(canceled, TASKS - 1);
        assert!(!f.registry.get(TEMPORARY).unwrap().is_canceled());
    }

    #[tokio::test]
    async fn test_stop_observe() {
        let f = fixture();
        let (sink, _stream) = channel();
        f.handlers.register("h", Arc::new(sink)).unwrap();
        assert!(!f.controller.stop_observe(TEMPORARY, &f.registry));

        f.controller
            .start_observe(get(TEMPORARY), "h", &f.registry)
            .unwrap();
        assert!(f.controller.stop_observe(TEMPORARY, &f.registry));
        assert!(!f.controller.stop_observe(TEMPORARY, &f.registry));

        let relations = f.transport.relations("/observe/temporary");
        assert_eq!(relations[0].proactive_cancels(), 1);
        assert!(f.controller.list_observations(&f.registry).is_empty());
    }
}
