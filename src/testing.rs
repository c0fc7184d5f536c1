//! In-memory [`Transport`] serving the resources of a small functional test server:
//!
//! * `/basic/<method>_me` answers that method with `<METHOD> called on: <path>` and rejects the
//!   others with 4.05; `/basic/do_not_<method>_me` always answers 4.05.
//! * `/observe/temporary` and `/observe/permanent` are observable, start out as `nothing`, are
//!   set by PUT and POST (2.04) and reset by DELETE (2.02).  Every change is notified.
//! * `/silent` never answers, neither does any resource on [`SILENT_HOST`].
//! * `/.well-known/core` lists the above.
//!
//! Host [`UNRESOLVABLE_HOST`] fails name resolution.  Callbacks are always delivered from a
//! single background task, in the order they were produced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::options::encode_uint;
use crate::request::{method_name, Request};
use crate::transport::{ExchangeHandler, ObserveRelation, Transport, TransportError};
use crate::uri::CoapUri;

pub const UNRESOLVABLE_HOST: &str = "unresolvable.invalid";
pub const SILENT_HOST: &str = "silent.invalid";

const OBSERVABLE_PATHS: &[&str] = &["/observe/temporary", "/observe/permanent"];
const INITIAL_CONTENT: &str = "nothing";

const CORE_LINKS: &str = concat!(
    "</basic/get_me>;ct=0,</basic/put_me>;ct=0,</basic/post_me>;ct=0,",
    "</basic/delete_me>;ct=0,</observe/temporary>;obs;ct=0,</observe/permanent>;obs;ct=0"
);

#[derive(Debug, Default)]
pub struct MockRelation {
    canceled: AtomicBool,
    proactive_cancels: AtomicUsize,
    reregistrations: AtomicUsize,
}

impl MockRelation {
    pub fn proactive_cancels(&self) -> usize {
        self.proactive_cancels.load(Ordering::SeqCst)
    }

    pub fn reregistrations(&self) -> usize {
        self.reregistrations.load(Ordering::SeqCst)
    }

    /// Let the relation lapse without telling anyone, as a server forgetting about us would.
    pub fn cancel_silently(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn is_proactively_canceled(&self) -> bool {
        self.proactive_cancels() > 0
    }
}

impl ObserveRelation for MockRelation {
    fn proactive_cancel(&self) {
        self.proactive_cancels.fetch_add(1, Ordering::SeqCst);
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn reregister(&self) {
        self.reregistrations.fetch_add(1, Ordering::SeqCst);
    }
}

enum Delivery {
    Load(Arc<dyn ExchangeHandler>, Packet),
    Error(Arc<dyn ExchangeHandler>),
}

struct Observer {
    path: String,
    handler: Arc<dyn ExchangeHandler>,
    relation: Arc<MockRelation>,
}

#[derive(Default)]
struct MockState {
    contents: BTreeMap<String, String>,
    observers: Vec<Observer>,
    sent: Vec<Request>,
    observe_requests: Vec<Request>,
    pings: usize,
    sequence: u64,
    shut_down: bool,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    deliveries: UnboundedSender<Delivery>,
}

impl MockTransport {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (deliveries, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Load(handler, packet) => handler.on_load(packet),
                    Delivery::Error(handler) => handler.on_error(),
                }
            }
        });
        Self {
            state: Mutex::new(MockState::default()),
            deliveries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every request passed to `send` or `send_async`, in order.
    pub fn sent(&self) -> Vec<Request> {
        self.lock().sent.clone()
    }

    /// Every request passed to `observe`, in order.
    pub fn observe_requests(&self) -> Vec<Request> {
        self.lock().observe_requests.clone()
    }

    pub fn pings(&self) -> usize {
        self.lock().pings
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Relations ever created for `path`, oldest first.
    pub fn relations(&self, path: &str) -> Vec<Arc<MockRelation>> {
        self.lock()
            .observers
            .iter()
            .filter(|observer| observer.path == path)
            .map(|observer| observer.relation.clone())
            .collect()
    }

    /// Report a transport error on every live relation for `path`.
    pub fn fail_relation(&self, path: &str) {
        let state = self.lock();
        for observer in live_observers(&state, path) {
            let _ = self.deliveries.send(Delivery::Error(observer.handler.clone()));
        }
    }

    /// Report a transport error to the `index`-th relation ever created for `path`, even one
    /// that has been canceled since.
    pub fn fail_observer(&self, path: &str, index: usize) {
        let state = self.lock();
        if let Some(observer) = state
            .observers
            .iter()
            .filter(|observer| observer.path == path)
            .nth(index)
        {
            let _ = self.deliveries.send(Delivery::Error(observer.handler.clone()));
        }
    }

    fn check_host(&self, uri: &CoapUri) -> Result<(), TransportError> {
        if self.lock().shut_down {
            return Err(TransportError::Shutdown);
        }
        if uri.host() == UNRESOLVABLE_HOST {
            return Err(TransportError::Unresolvable(uri.host()));
        }
        Ok(())
    }

    fn exchange(&self, request: &Request) -> Option<Packet> {
        let mut state = self.lock();
        state.sent.push(request.clone());
        if request.uri().host() == SILENT_HOST {
            return None;
        }
        let path = request.uri().path().to_string();
        let method = request.method();

        if OBSERVABLE_PATHS.contains(&path.as_str()) {
            let (code, changed) = match method {
                RequestType::Get => (ResponseType::Content, false),
                RequestType::Put | RequestType::Post => {
                    let content = String::from_utf8_lossy(&request.message().payload).into_owned();
                    state.contents.insert(path.clone(), content);
                    (ResponseType::Changed, true)
                }
                RequestType::Delete => {
                    state.contents.remove(&path);
                    (ResponseType::Deleted, true)
                }
                _ => (ResponseType::MethodNotAllowed, false),
            };
            let payload = if code == ResponseType::Content {
                current_content(&state, &path).into_bytes()
            } else {
                Vec::new()
            };
            if changed {
                self.notify(&mut state, &path);
            }
            return Some(response(code, payload));
        }

        let reply = match path.as_str() {
            "/silent" => return None,
            "/.well-known/core" => {
                let mut packet = response(ResponseType::Content, CORE_LINKS.as_bytes().to_vec());
                packet.add_option(CoapOption::ContentFormat, encode_uint(40));
                packet
            }
            path if path.starts_with("/basic/do_not_") => {
                response(ResponseType::MethodNotAllowed, Vec::new())
            }
            path if path.starts_with("/basic/") => {
                let expected = format!("/basic/{}_me", method_name(method).to_lowercase());
                if path == expected {
                    let code = match method {
                        RequestType::Get => ResponseType::Content,
                        RequestType::Put => ResponseType::Changed,
                        RequestType::Post => ResponseType::Created,
                        _ => ResponseType::Deleted,
                    };
                    let payload = format!("{} called on: {path}", method_name(method));
                    let mut packet = response(code, payload.into_bytes());
                    packet.add_option(CoapOption::ContentFormat, encode_uint(0));
                    packet
                } else {
                    response(ResponseType::MethodNotAllowed, Vec::new())
                }
            }
            _ => response(ResponseType::NotFound, Vec::new()),
        };
        Some(reply)
    }

    fn notify(&self, state: &mut MockState, path: &str) {
        state.sequence += 1;
        let packet = notification(state.sequence, current_content(state, path));
        for observer in live_observers(state, path) {
            let _ = self
                .deliveries
                .send(Delivery::Load(observer.handler.clone(), packet.clone()));
        }
    }
}

fn live_observers<'a>(state: &'a MockState, path: &'a str) -> impl Iterator<Item = &'a Observer> + 'a {
    state
        .observers
        .iter()
        .filter(move |observer| observer.path == path && !observer.relation.is_proactively_canceled())
}

fn current_content(state: &MockState, path: &str) -> String {
    state
        .contents
        .get(path)
        .cloned()
        .unwrap_or_else(|| INITIAL_CONTENT.to_string())
}

fn response(code: ResponseType, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Acknowledgement);
    packet.header.code = MessageClass::Response(code);
    packet.payload = payload;
    packet
}

fn notification(sequence: u64, content: String) -> Packet {
    let mut packet = response(ResponseType::Content, content.into_bytes());
    packet.add_option(CoapOption::Observe, encode_uint(sequence));
    packet
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: Request) -> Result<Option<Packet>, TransportError> {
        self.check_host(request.uri())?;
        Ok(self.exchange(&request))
    }

    fn send_async(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<(), TransportError> {
        self.check_host(request.uri())?;
        let delivery = match self.exchange(&request) {
            Some(packet) => Delivery::Load(handler, packet),
            None => Delivery::Error(handler),
        };
        let _ = self.deliveries.send(delivery);
        Ok(())
    }

    fn observe(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Arc<dyn ObserveRelation>, TransportError> {
        self.check_host(request.uri())?;
        let path = request.uri().path().to_string();
        let relation = Arc::new(MockRelation::default());

        let mut state = self.lock();
        state.observe_requests.push(request.clone());
        let first = if OBSERVABLE_PATHS.contains(&path.as_str()) {
            state.sequence += 1;
            notification(state.sequence, current_content(&state, &path))
        } else {
            relation.cancel_silently();
            response(ResponseType::NotFound, Vec::new())
        };
        state.observers.push(Observer {
            path,
            handler: handler.clone(),
            relation: relation.clone(),
        });
        let _ = self.deliveries.send(Delivery::Load(handler, first));

        Ok(relation)
    }

    async fn ping(&self, uri: &CoapUri) -> Result<bool, TransportError> {
        self.check_host(uri)?;
        self.lock().pings += 1;
        Ok(uri.host() != SILENT_HOST)
    }

    async fn shutdown(&self) {
        self.lock().shut_down = true;
    }
}
