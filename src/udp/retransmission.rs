use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::anyhow;
use coap_lite::{MessageType, Packet};
use log::debug;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time;

pub type MessageId = u16;

/// Lifetime of a Non-confirmable message exchange per RFC 7252 section 4.8.2.
const NON_LIFETIME: Duration = Duration::from_secs(145);

type AwaitingReply<Endpoint> = HashMap<(MessageId, Endpoint), oneshot::Sender<Reply>>;

/// Hands out message IDs and tracks the Confirmable messages still waiting for their
/// Acknowledgement or Reset.  A send stays tracked only while its [`SendReliably`] is alive.
pub struct RetransmissionManager<Endpoint: Debug + Clone + Eq + Hash> {
    next_message_id: MessageId,
    awaiting_reply: Arc<Mutex<AwaitingReply<Endpoint>>>,
    parameters: TransmissionParameters,
}

/// Transmission parameters of RFC 7252 section 4.8, plus how long to wait for a response once
/// a request has been acknowledged or sent Non-confirmable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParameters {
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
    response_timeout: Option<Duration>,
    non_lifetime: Duration,
}

#[derive(Debug)]
enum Reply {
    Acknowledged,
    Reset,
    /// The message ID wrapped around while this send was still outstanding.
    Superseded,
}

impl<Endpoint: Debug + Clone + Eq + Hash> RetransmissionManager<Endpoint> {
    pub fn new(parameters: TransmissionParameters) -> Self {
        Self {
            next_message_id: rand::thread_rng().gen(),
            awaiting_reply: Arc::new(Mutex::new(HashMap::new())),
            parameters,
        }
    }

    fn awaiting_reply(&self) -> MutexGuard<'_, AwaitingReply<Endpoint>> {
        self.awaiting_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_message_id(&mut self) -> MessageId {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        message_id
    }

    /// Match an Acknowledgement or Reset against the outstanding sends.  A piggybacked response
    /// counts as an Acknowledgement, but routing it to its exchange is up to the caller.
    pub fn maybe_handle_reply(&self, packet: &Packet, peer: &Endpoint) -> bool {
        let reply = match packet.header.get_type() {
            MessageType::Acknowledgement => Reply::Acknowledged,
            MessageType::Reset => Reply::Reset,
            _ => return false,
        };
        let reply_tx = self
            .awaiting_reply()
            .remove(&(packet.header.message_id, peer.clone()));
        match reply_tx {
            Some(reply_tx) => {
                let _ = reply_tx.send(reply);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.awaiting_reply().len()
    }

    /// Prepare a Confirmable send with a fresh message ID.  Nothing goes out until the returned
    /// [`SendReliably`] is driven.
    pub fn send_reliably(
        &mut self,
        mut packet: Packet,
        peer: Endpoint,
        packet_tx: UnboundedSender<(Packet, Endpoint)>,
    ) -> SendReliably<Endpoint> {
        packet.header.message_id = self.next_message_id();
        packet.header.set_type(MessageType::Confirmable);

        let (reply_tx, reply_rx) = oneshot::channel();
        let key = (packet.header.message_id, peer.clone());
        if let Some(previous) = self.awaiting_reply().insert(key.clone(), reply_tx) {
            let _ = previous.send(Reply::Superseded);
        }

        SendReliably {
            packet,
            packet_tx,
            peer,
            parameters: self.parameters,
            reply_rx,
            tracking: Tracking {
                key,
                awaiting_reply: Arc::downgrade(&self.awaiting_reply),
            },
        }
    }
}

/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8.2).
impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            response_timeout: None,
            non_lifetime: NON_LIFETIME,
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
            ..Default::default()
        })
    }

    /// How long to wait for a separate response after the request was acknowledged.  Defaults to
    /// MAX_TRANSMIT_WAIT.
    pub fn set_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// How long to wait for the response to a Non-confirmable request.
    pub fn set_non_lifetime(mut self, lifetime: Duration) -> Self {
        self.non_lifetime = lifetime;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Initial retransmission timeout is picked at random from this range.
    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        self.ack_timeout..=self.ack_timeout.mul_f32(self.ack_random_factor)
    }

    /// ACK_TIMEOUT * (2 ^ (MAX_RETRANSMIT + 1) - 1) * ACK_RANDOM_FACTOR
    pub fn max_transmit_wait(&self) -> Duration {
        let attempts = 2u32.saturating_pow(self.max_retransmit as u32 + 1) - 1;
        self.ack_timeout
            .saturating_mul(attempts)
            .mul_f32(self.ack_random_factor)
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
            .unwrap_or_else(|| self.max_transmit_wait())
    }

    pub fn non_lifetime(&self) -> Duration {
        self.non_lifetime
    }
}

#[must_use = "nothing is sent until into_future() is awaited"]
pub struct SendReliably<Endpoint: Eq + Hash> {
    packet: Packet,
    peer: Endpoint,
    packet_tx: UnboundedSender<(Packet, Endpoint)>,
    parameters: TransmissionParameters,
    reply_rx: oneshot::Receiver<Reply>,
    /// Declared after `reply_rx`, which must already be closed when this is dropped.
    tracking: Tracking<Endpoint>,
}

/// Removes the send from the manager once it is over, whether it completed, gave up or was
/// dropped half way.
struct Tracking<Endpoint: Eq + Hash> {
    key: (MessageId, Endpoint),
    awaiting_reply: Weak<Mutex<AwaitingReply<Endpoint>>>,
}

impl<Endpoint: Eq + Hash> Drop for Tracking<Endpoint> {
    fn drop(&mut self) {
        let awaiting_reply = match self.awaiting_reply.upgrade() {
            Some(awaiting_reply) => awaiting_reply,
            None => return,
        };
        let mut awaiting_reply = awaiting_reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A later send that reused the message ID still has an open receiver.
        if awaiting_reply
            .get(&self.key)
            .map_or(false, oneshot::Sender::is_closed)
        {
            awaiting_reply.remove(&self.key);
        }
    }
}

impl<Endpoint: Debug + Clone + Eq + Hash> SendReliably<Endpoint> {
    pub fn get_message_id(&self) -> MessageId {
        self.packet.header.message_id
    }

    /// Transmit until the peer replies, doubling the timeout after every attempt
    /// (RFC 7252 section 4.2).
    pub async fn into_future(mut self) -> Result<(), SendFailed> {
        let message_id = self.packet.header.message_id;
        let attempts = self.parameters.max_retransmit + 1;
        let mut timeout = rand::thread_rng().gen_range(self.parameters.ack_timeout_range());
        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(
                    "Retransmission #{attempt} of message ID {message_id} to {:?}",
                    self.peer
                );
            }
            self.packet_tx
                .send((self.packet.clone(), self.peer.clone()))
                .map_err(|_| anyhow!("outbound channel closed"))?;
            match time::timeout(timeout, &mut self.reply_rx).await {
                Err(_) => timeout *= 2,
                Ok(Ok(Reply::Acknowledged)) => return Ok(()),
                Ok(Ok(Reply::Reset)) => return Err(SendFailed::Reset),
                Ok(Ok(Reply::Superseded)) => {
                    return Err(SendFailed::InternalError(format!(
                        "message ID {message_id} reused by another send"
                    )))
                }
                Ok(Err(_)) => {
                    return Err(SendFailed::InternalError(
                        "no longer tracked by the retransmission manager".to_string(),
                    ))
                }
            }
        }
        Err(SendFailed::NoReply(attempts))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SendFailed {
    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("reset message received")]
    Reset,

    #[error(transparent)]
    TransmissionError(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coap_lite::{MessageType, Packet};
    use futures::{future, StreamExt};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::udp::retransmission::{RetransmissionManager, SendFailed, TransmissionParameters};

    #[derive(Default, Debug, Clone, PartialEq, Eq, Hash)]
    struct TestEndpoint(i32);

    fn reply(message_type: MessageType, message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(message_type);
        packet.header.message_id = message_id;
        packet
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let ack_timeout = Duration::from_secs(5);
        let mut manager =
            RetransmissionManager::new(TransmissionParameters::new(ack_timeout, 1.0, 1).unwrap());
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let handle = manager.send_reliably(Packet::new(), TestEndpoint(123), packet_tx);
        let message_id = handle.get_message_id();
        let result = handle.into_future().await;

        assert!(matches!(result, Err(SendFailed::NoReply(2))));

        let received: Vec<_> = UnboundedReceiverStream::new(packet_rx).collect().await;

        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.header.message_id, message_id);
        assert_eq!(received[0].0.header.get_type(), MessageType::Confirmable);
        assert_eq!(received[1].1, TestEndpoint(123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path() {
        let ack_timeout = Duration::from_secs(999);
        let mut manager =
            RetransmissionManager::new(TransmissionParameters::new(ack_timeout, 1.0, 0).unwrap());
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let handle = manager.send_reliably(Packet::new(), TestEndpoint(123), packet_tx);
        let ack_packet = reply(MessageType::Acknowledgement, handle.get_message_id());
        assert!(manager.maybe_handle_reply(&ack_packet, &TestEndpoint(123)));
        assert_eq!(manager.pending_count(), 0);

        handle.into_future().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let ack_timeout = Duration::from_secs(5);
        let mut manager =
            RetransmissionManager::new(TransmissionParameters::new(ack_timeout, 1.0, 0).unwrap());
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let handle = manager.send_reliably(Packet::new(), TestEndpoint(123), packet_tx);
        let reset_packet = reply(MessageType::Reset, handle.get_message_id());
        assert!(!manager.maybe_handle_reply(&reset_packet, &TestEndpoint(456)));
        assert!(manager.maybe_handle_reply(&reset_packet, &TestEndpoint(123)));

        assert!(matches!(handle.into_future().await, Err(SendFailed::Reset)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_is_forgotten() {
        let mut manager = RetransmissionManager::new(TransmissionParameters::default());
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let handle = manager.send_reliably(Packet::new(), TestEndpoint(1), packet_tx.clone());
        let message_id = handle.get_message_id();
        assert_eq!(manager.pending_count(), 1);
        drop(handle);
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.maybe_handle_reply(
            &reply(MessageType::Acknowledgement, message_id),
            &TestEndpoint(1)
        ));
        assert_eq!(manager.next_message_id(), message_id.wrapping_add(1));

        let handle = manager.send_reliably(Packet::new(), TestEndpoint(1), packet_tx);
        let mut send = Box::pin(handle.into_future());
        assert!(futures::poll!(&mut send).is_pending());
        assert_eq!(manager.pending_count(), 1);
        drop(send);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_sends_are_forgotten() {
        let ack_timeout = Duration::from_secs(2);
        let mut manager =
            RetransmissionManager::new(TransmissionParameters::new(ack_timeout, 1.0, 1).unwrap());
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let sends: Vec<_> = (0..10)
            .map(|i| manager.send_reliably(Packet::new(), TestEndpoint(i), packet_tx.clone()))
            .collect();
        assert_eq!(manager.pending_count(), 10);

        let results = future::join_all(sends.into_iter().map(|send| send.into_future())).await;
        assert!(results
            .iter()
            .all(|result| matches!(result, Err(SendFailed::NoReply(2)))));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_message_id_stays_tracked() {
        let mut manager = RetransmissionManager::new(TransmissionParameters::default());
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();

        let first = manager.send_reliably(Packet::new(), TestEndpoint(1), packet_tx.clone());
        let message_id = first.get_message_id();
        for _ in 0..u16::MAX {
            manager.next_message_id();
        }
        let second = manager.send_reliably(Packet::new(), TestEndpoint(1), packet_tx);
        assert_eq!(second.get_message_id(), message_id);

        assert!(matches!(
            first.into_future().await,
            Err(SendFailed::InternalError(_))
        ));
        assert_eq!(manager.pending_count(), 1);
        assert!(manager.maybe_handle_reply(
            &reply(MessageType::Acknowledgement, message_id),
            &TestEndpoint(1)
        ));
        second.into_future().await.unwrap();
    }

    #[test]
    fn test_parameters() {
        assert!(TransmissionParameters::new(Duration::from_secs(2), 0.5, 4).is_err());
        assert!(TransmissionParameters::new(Duration::ZERO, 1.5, 4).is_err());

        let defaults = TransmissionParameters::default();
        assert_eq!(defaults.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(defaults.response_timeout(), Duration::from_secs(93));
        assert_eq!(defaults.non_lifetime(), Duration::from_secs(145));

        let custom = defaults.set_response_timeout(Duration::from_secs(1));
        assert_eq!(custom.response_timeout(), Duration::from_secs(1));
    }
}
