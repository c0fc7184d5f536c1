use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use coap_lite::{MessageClass, MessageType, Packet};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use tokio::net::{self, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::config::ClientConfig;
use crate::request::Request;
use crate::response::ends_observation;
use crate::transport::{ExchangeHandler, ObserveRelation, Transport, TransportError};
use crate::uri::CoapUri;

pub use retransmission::TransmissionParameters;
use retransmission::{RetransmissionManager, SendFailed};

mod retransmission;

type Token = Vec<u8>;

const TOKEN_LENGTH: usize = 8;

/// Default CoAP transport as originally defined in RFC 7252: a single UDP socket shared by all
/// exchanges, with Confirmable retransmission and observe relations multiplexed by token.
///
/// All socket I/O happens on one background task.  Callbacks of asynchronous exchanges run on
/// a task of their own; the notifications of one observe relation are delivered in order by a
/// per-relation task.
pub struct UdpTransport {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    local_addr: SocketAddr,
    runtime: Handle,
    outbound: UnboundedSender<(Packet, SocketAddr)>,
    retransmission: Mutex<RetransmissionManager<SocketAddr>>,
    exchanges: Mutex<Exchanges>,
    parameters: TransmissionParameters,
    log_messages: bool,
    closed: AtomicBool,
}

#[derive(Default)]
struct Exchanges {
    pending: HashMap<Token, Pending>,
    observers: HashMap<Token, Observer>,
}

struct Pending {
    peer: SocketAddr,
    reply: oneshot::Sender<Packet>,
}

struct Observer {
    events: UnboundedSender<ObserverEvent>,
    relation: Arc<UdpRelation>,
}

enum ObserverEvent {
    Load(Packet),
    Error,
}

impl UdpTransport {
    /// Bind the configured local address and start the I/O task.
    pub async fn bind(config: &ClientConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.local_address()).await?;
        let local_addr = socket.local_addr()?;
        debug!("Bound CoAP client endpoint to {local_addr}");

        let parameters = config.transmission_parameters();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            local_addr,
            runtime: Handle::current(),
            outbound: outbound_tx,
            retransmission: Mutex::new(RetransmissionManager::new(parameters)),
            exchanges: Mutex::new(Exchanges::default()),
            parameters,
            log_messages: config.log_messages(),
            closed: AtomicBool::new(false),
        });

        let framed_socket = UdpFramed::new(socket, Codec::default());
        let worker = tokio::spawn(run(
            framed_socket,
            outbound_rx,
            shutdown_rx,
            Arc::downgrade(&inner),
        ));

        Ok(Self {
            inner,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

async fn run(
    mut framed_socket: UdpFramed<Codec>,
    mut outbound_rx: UnboundedReceiver<(Packet, SocketAddr)>,
    mut shutdown_rx: watch::Receiver<bool>,
    inner: Weak<Inner>,
) {
    loop {
        tokio::select! {
            event = framed_socket.next() => {
                let inner = match inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                match event {
                    Some(Ok((packet, peer))) => inner.handle_inbound(packet, peer),
                    Some(Err(e)) => warn!("Error receiving packet: {e}"),
                    None => break,
                }
            }
            Some((packet, peer)) = outbound_rx.recv() => {
                send_packet(&mut framed_socket, &inner, packet, peer).await;
            }
            _ = shutdown_rx.changed() => {
                while let Ok((packet, peer)) = outbound_rx.try_recv() {
                    send_packet(&mut framed_socket, &inner, packet, peer).await;
                }
                break;
            }
        }
    }
    debug!("CoAP client endpoint closed");
}

async fn send_packet(
    framed_socket: &mut UdpFramed<Codec>,
    inner: &Weak<Inner>,
    packet: Packet,
    peer: SocketAddr,
) {
    if let Some(inner) = inner.upgrade() {
        inner.log_packet("Outgoing packet to", &packet, &peer);
    }
    if let Err(e) = framed_socket.send((packet, peer)).await {
        error!("Error sending to {peer}: {e}");
    }
}

impl Inner {
    fn exchanges(&self) -> MutexGuard<'_, Exchanges> {
        self.exchanges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retransmission(&self) -> MutexGuard<'_, RetransmissionManager<SocketAddr>> {
        self.retransmission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn log_packet(&self, direction: &str, packet: &Packet, peer: &SocketAddr) {
        if self.log_messages {
            info!("{direction} {peer}: {packet:?}");
        } else {
            trace!("{direction} {peer}: {packet:?}");
        }
    }

    /// Resolve the URI's host, preferring addresses of our own socket's family.
    async fn resolve(&self, uri: &CoapUri) -> Result<SocketAddr, TransportError> {
        let host = uri.host();
        let candidates: Vec<_> = net::lookup_host((host.as_str(), uri.port()))
            .await
            .map_err(|e| {
                debug!("Resolving {host} failed: {e}");
                TransportError::Unresolvable(host.clone())
            })?
            .collect();
        candidates
            .iter()
            .find(|addr| addr.is_ipv4() == self.local_addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or(TransportError::Unresolvable(host))
    }

    fn enqueue(&self, packet: Packet, peer: SocketAddr) -> Result<(), TransportError> {
        self.outbound
            .send((packet, peer))
            .map_err(|_| TransportError::Shutdown)
    }

    fn send_empty(&self, message_type: MessageType, message_id: u16, peer: SocketAddr) {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.code = MessageClass::Empty;
        packet.header.message_id = message_id;
        let _ = self.enqueue(packet, peer);
    }

    /// Perform a full request/response exchange.  `Ok(None)` means no response will arrive.
    async fn exchange(&self, mut packet: Packet, peer: SocketAddr) -> Result<Option<Packet>, TransportError> {
        self.ensure_open()?;
        if packet.get_token().is_empty() {
            packet.set_token(new_token());
        }
        let token = packet.get_token().to_vec();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.exchanges().pending.insert(
            token.clone(),
            Pending {
                peer,
                reply: reply_tx,
            },
        );
        let _pending = PendingExchange { inner: self, token };
        self.await_response(packet, peer, reply_rx).await
    }

    async fn await_response(
        &self,
        mut packet: Packet,
        peer: SocketAddr,
        mut reply_rx: oneshot::Receiver<Packet>,
    ) -> Result<Option<Packet>, TransportError> {
        if packet.header.get_type() != MessageType::Confirmable {
            packet.header.message_id = self.retransmission().next_message_id();
            self.enqueue(packet, peer)?;
            return Ok(time::timeout(self.parameters.non_lifetime(), reply_rx)
                .await
                .ok()
                .and_then(Result::ok));
        }

        let send = self
            .retransmission()
            .send_reliably(packet, peer, self.outbound.clone());
        let message_id = send.get_message_id();
        let acknowledged = tokio::select! {
            reply = &mut reply_rx => return Ok(reply.ok()),
            acknowledged = send.into_future() => acknowledged,
        };
        match acknowledged {
            Ok(()) => {}
            Err(failure @ (SendFailed::Reset | SendFailed::NoReply(_))) => {
                debug!("No response to message ID {message_id} from {peer}: {failure}");
                return Ok(None);
            }
            Err(SendFailed::TransmissionError(_)) => return Err(TransportError::Shutdown),
            Err(SendFailed::InternalError(e)) => return Err(TransportError::Unspecified(e)),
        }
        Ok(time::timeout(self.parameters.response_timeout(), reply_rx)
            .await
            .ok()
            .and_then(Result::ok))
    }

    fn handle_inbound(&self, packet: Packet, peer: SocketAddr) {
        self.log_packet("Incoming packet from", &packet, &peer);
        let message_type = packet.header.get_type();
        match packet.header.code {
            MessageClass::Empty => match message_type {
                MessageType::Acknowledgement | MessageType::Reset => {
                    if !self.retransmission().maybe_handle_reply(&packet, &peer) {
                        debug!("Ignoring unmatched {message_type:?} from {peer}");
                    }
                }
                MessageType::Confirmable => {
                    self.send_empty(MessageType::Reset, packet.header.message_id, peer)
                }
                MessageType::NonConfirmable => {}
            },
            MessageClass::Response(_) => self.handle_response(packet, peer),
            _ => {
                if message_type == MessageType::Confirmable {
                    self.send_empty(MessageType::Reset, packet.header.message_id, peer);
                }
            }
        }
    }

    fn handle_response(&self, packet: Packet, peer: SocketAddr) {
        let message_type = packet.header.get_type();
        let message_id = packet.header.message_id;
        if message_type == MessageType::Acknowledgement {
            self.retransmission().maybe_handle_reply(&packet, &peer);
        }
        let routed = self.route_response(packet, peer);
        match (message_type, routed) {
            (MessageType::Confirmable, true) => {
                self.send_empty(MessageType::Acknowledgement, message_id, peer)
            }
            (MessageType::Confirmable, false) | (MessageType::NonConfirmable, false) => {
                debug!("Rejecting response with unknown token from {peer}");
                self.send_empty(MessageType::Reset, message_id, peer);
            }
            _ => {}
        }
    }

    /// Hand the response to its exchange or observe relation.  No lock is held while the
    /// receiving side runs.
    fn route_response(&self, packet: Packet, peer: SocketAddr) -> bool {
        let token = packet.get_token().to_vec();
        let mut exchanges = self.exchanges();

        if exchanges
            .pending
            .get(&token)
            .map_or(false, |pending| pending.peer == peer)
        {
            if let Some(pending) = exchanges.pending.remove(&token) {
                drop(exchanges);
                let _ = pending.reply.send(packet);
            }
            return true;
        }

        let events = match exchanges.observers.get(&token) {
            Some(observer) if observer.relation.accepts(&peer) => observer.events.clone(),
            _ => return false,
        };
        if ends_observation(&packet) {
            if let Some(observer) = exchanges.observers.remove(&token) {
                debug!("Observe relation on {} ended by server", observer.relation.uri);
                observer.relation.mark_canceled();
            }
        }
        drop(exchanges);
        let _ = events.send(ObserverEvent::Load(packet));
        true
    }

    /// Report a failed registration to the relation's handler.  `cancel` additionally ends the
    /// relation, so that a fresh one is created by whoever recovers from the error.
    fn fail_observer(&self, token: &[u8], cancel: bool) {
        let mut exchanges = self.exchanges();
        let events = if cancel {
            exchanges.observers.remove(token).map(|observer| {
                observer.relation.mark_canceled();
                observer.events
            })
        } else {
            exchanges
                .observers
                .get(token)
                .map(|observer| observer.events.clone())
        };
        drop(exchanges);
        if let Some(events) = events {
            let _ = events.send(ObserverEvent::Error);
        }
    }

    /// Send (or resend) the registration of an observe relation.  Notifications, including the
    /// response to the registration itself, are routed by token from then on.
    async fn register_observer(self: Arc<Self>, uri: CoapUri, token: Token, mut message: Packet) {
        let peer = match self.resolve(&uri).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Cannot register observe relation on {uri}: {e}");
                time::sleep(self.parameters.ack_timeout()).await;
                self.fail_observer(&token, true);
                return;
            }
        };
        match self.exchanges().observers.get(&token) {
            Some(observer) => observer.relation.set_peer(peer),
            None => return,
        }
        message.set_token(token.clone());

        if message.header.get_type() != MessageType::Confirmable {
            message.header.message_id = self.retransmission().next_message_id();
            if self.enqueue(message, peer).is_err() {
                self.fail_observer(&token, true);
            }
            return;
        }

        let send = self
            .retransmission()
            .send_reliably(message, peer, self.outbound.clone());
        match send.into_future().await {
            Ok(()) => {}
            Err(SendFailed::NoReply(attempts)) => {
                debug!("Observe registration on {uri} unanswered after {attempts} attempts");
                self.fail_observer(&token, false);
            }
            Err(e) => {
                debug!("Observe registration on {uri} failed: {e}");
                time::sleep(self.parameters.ack_timeout()).await;
                self.fail_observer(&token, true);
            }
        }
    }
}

/// Token of an exchange in flight.  Dropping it forgets the exchange, so that an exchange whose
/// future is abandoned leaves nothing behind.
struct PendingExchange<'a> {
    inner: &'a Inner,
    token: Token,
}

impl Drop for PendingExchange<'_> {
    fn drop(&mut self) {
        self.inner.exchanges().pending.remove(&self.token);
    }
}

/// Transport handle of one observe relation, identified by its token.
#[derive(Debug)]
pub struct UdpRelation {
    token: Token,
    uri: CoapUri,
    registration: Request,
    peer: Mutex<Option<SocketAddr>>,
    transport: Weak<Inner>,
    canceled: AtomicBool,
    deregistered: AtomicBool,
}

impl UdpRelation {
    fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_peer(&self, peer: SocketAddr) {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
    }

    fn accepts(&self, peer: &SocketAddr) -> bool {
        self.peer().map_or(true, |expected| expected == *peer)
    }

    fn mark_canceled(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn register(&self) {
        if let Some(inner) = self.transport.upgrade() {
            let runtime = inner.runtime.clone();
            runtime.spawn(inner.register_observer(
                self.uri.clone(),
                self.token.clone(),
                self.registration.message().clone(),
            ));
        }
    }
}

impl ObserveRelation for UdpRelation {
    /// Sends the deregistration immediately and exactly once, without waiting for the answer.
    fn proactive_cancel(&self) {
        self.mark_canceled();
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = match self.transport.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        inner.exchanges().observers.remove(&self.token);
        if let Some(peer) = self.peer() {
            debug!("Deregistering observe relation on {}", self.uri);
            let mut message = self.registration.deregistration().into_message();
            message.set_token(self.token.clone());
            message.header.message_id = inner.retransmission().next_message_id();
            let _ = inner.enqueue(message, peer);
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn reregister(&self) {
        if self.is_canceled() {
            return;
        }
        debug!("Re-registering observe relation on {}", self.uri);
        self.register();
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, request: Request) -> Result<Option<Packet>, TransportError> {
        self.inner.ensure_open()?;
        let peer = self.inner.resolve(request.uri()).await?;
        self.inner.exchange(request.into_message(), peer).await
    }

    fn send_async(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let uri = request.uri().clone();
            let result = match inner.resolve(&uri).await {
                Ok(peer) => inner.exchange(request.into_message(), peer).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(response)) => handler.on_load(response),
                Ok(None) => handler.on_error(),
                Err(e) => {
                    warn!("Exchange with {uri} failed: {e}");
                    handler.on_error();
                }
            }
        });
        Ok(())
    }

    fn observe(
        &self,
        request: Request,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Arc<dyn ObserveRelation>, TransportError> {
        self.inner.ensure_open()?;
        let token = new_token();
        let relation = Arc::new(UdpRelation {
            token: token.clone(),
            uri: request.uri().clone(),
            registration: request.registration(),
            peer: Mutex::new(None),
            transport: Arc::downgrade(&self.inner),
            canceled: AtomicBool::new(false),
            deregistered: AtomicBool::new(false),
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        self.inner.exchanges().observers.insert(
            token,
            Observer {
                events: events_tx,
                relation: relation.clone(),
            },
        );
        self.inner.runtime.spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ObserverEvent::Load(packet) => handler.on_load(packet),
                    ObserverEvent::Error => handler.on_error(),
                }
            }
        });

        relation.register();
        Ok(relation)
    }

    async fn ping(&self, uri: &CoapUri) -> Result<bool, TransportError> {
        self.inner.ensure_open()?;
        let peer = self.inner.resolve(uri).await?;
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Empty;
        let send = self
            .inner
            .retransmission()
            .send_reliably(packet, peer, self.inner.outbound.clone());
        match send.into_future().await {
            Err(SendFailed::Reset) => Ok(true),
            Ok(()) => {
                debug!("Ping to {peer} was acknowledged instead of reset");
                Ok(false)
            }
            Err(SendFailed::NoReply(_)) => Ok(false),
            Err(SendFailed::TransmissionError(_)) => Err(TransportError::Shutdown),
            Err(SendFailed::InternalError(e)) => Err(TransportError::Unspecified(e)),
        }
    }

    async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut exchanges = self.inner.exchanges();
            exchanges.pending.clear();
            exchanges.observers.clear();
        }
        let _ = self.shutdown_tx.send(true);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("CoAP client endpoint task failed: {e}");
            }
        }
    }
}

fn new_token() -> Token {
    rand::thread_rng().gen::<[u8; TOKEN_LENGTH]>().to_vec()
}

#[derive(Default)]
struct Codec;

impl Decoder for Codec {
    type Item = Packet;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, TransportError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let result = Packet::from_bytes(&buf[..]).map(Some).map_err(TransportError::from);
        buf.clear();
        result
    }
}

impl Encoder<Packet> for Codec {
    type Error = TransportError;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<(), TransportError> {
        buf.extend_from_slice(&packet.to_bytes()?[..]);
        Ok(())
    }
}
