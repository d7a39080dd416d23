//! Consumer sessions.
//!
//! A `ConsumerSession` is the object handed to the router for one
//! subscription. The router offers it deliveries; the session converts them
//! to outbound MESSAGE frames on the connection's frame sink, registers them
//! with the subscription's ack tracker, and filters by selector. The session
//! is shared with the router layer, so the tracker sits behind a mutex; all
//! other fields are immutable after construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::broker::{BindingSpec, Delivery, Destination, StoreUow, STOMP_PROTOCOL};
use crate::stomp::acks::{AckError, AckMode, AckTracker};
use crate::stomp::frame::{command, header, StompItem};
use crate::stomp::selector::Selector;

/// Connection-level index from message id to subscription key. Exists only
/// for STOMP 1.0 connections, whose ACK frames may omit the subscription
/// header; kept in lockstep with the per-subscription trackers.
pub type FallbackAckIndex = Arc<Mutex<HashMap<String, String>>>;

pub struct ConsumerSession {
    /// Client-supplied `id`, added to MESSAGE frames as `subscription`.
    /// `None` for 1.0 subscriptions identified by destination alone.
    subscription_id: Option<String>,
    /// Map key within the connection: the id, or the destination for the
    /// 1.0 fallback.
    key: String,
    destination: Destination,
    tracker: Mutex<AckTracker>,
    selector: Option<Selector>,
    binding: Option<BindingSpec>,
    sink: mpsc::Sender<StompItem>,
    fallback: Option<FallbackAckIndex>,
    closed: AtomicBool,
}

impl ConsumerSession {
    pub fn new(
        subscription_id: Option<String>,
        destination: Destination,
        ack_mode: AckMode,
        selector: Option<Selector>,
        binding: Option<BindingSpec>,
        sink: mpsc::Sender<StompItem>,
        fallback: Option<FallbackAckIndex>,
    ) -> Self {
        let key = subscription_id
            .clone()
            .unwrap_or_else(|| destination.to_string());
        Self {
            subscription_id,
            key,
            destination,
            tracker: Mutex::new(AckTracker::new(ack_mode)),
            selector,
            binding,
            sink,
            fallback,
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn binding(&self) -> Option<&BindingSpec> {
        self.binding.as_ref()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.tracker.lock().mode()
    }

    pub fn pending_acks(&self) -> usize {
        self.tracker.lock().pending()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting deliveries. Called on UNSUBSCRIBE and connection
    /// teardown, before the router unbind completes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True when the delivery originated from this protocol and passes the
    /// subscription's selector, if any.
    pub fn matches(&self, delivery: &Delivery) -> bool {
        delivery.sender_protocol == STOMP_PROTOCOL
            && self
                .selector
                .as_ref()
                .map_or(true, |s| s.matches(&delivery.message))
    }

    /// Offer a delivery to the connection's outbound sink.
    ///
    /// Returns `false` when the sink is full (the producer must suspend) or
    /// the session is closed. Otherwise the delivery is registered with the
    /// ack tracker, rewritten into a MESSAGE frame, and enqueued; once a
    /// slot is reserved the send cannot fail.
    pub fn offer(&self, delivery: Delivery) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(permit) = self.sink.try_reserve() else {
            return false;
        };

        let Delivery {
            mut message,
            uow,
            ack,
            ..
        } = delivery;
        message.command = command::MESSAGE.to_string();
        if let Some(id) = &self.subscription_id {
            message.set(header::SUBSCRIPTION, id.clone());
        }
        let message_id = message
            .get(header::MESSAGE_ID)
            .unwrap_or_default()
            .to_string();

        {
            let mut tracker = self.tracker.lock();
            tracker.track(&message_id, ack, uow.as_deref());
            if tracker.mode() != AckMode::Auto {
                if let Some(fallback) = &self.fallback {
                    fallback.lock().insert(message_id, self.key.clone());
                }
            }
        }

        permit.send(StompItem::Frame(message));
        true
    }

    /// Apply an inbound ACK for `message_id` under `uow`, keeping the 1.0
    /// fallback index in lockstep on success.
    pub fn perform_ack(&self, message_id: &str, uow: Option<&dyn StoreUow>) -> Result<(), AckError> {
        self.tracker.lock().perform_ack(message_id, uow)?;
        if let Some(fallback) = &self.fallback {
            fallback.lock().remove(message_id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("key", &self.key)
            .field("destination", &self.destination.to_string())
            .field("ack_mode", &self.ack_mode().as_str())
            .field("durable", &self.binding.as_ref().map(BindingSpec::is_durable))
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::frame::Frame;

    fn delivery(message_id: &str, headers: &[(&str, &str)]) -> Delivery {
        let mut frame = Frame::new(command::SEND)
            .header(header::DESTINATION, "/queue/a")
            .header(header::MESSAGE_ID, message_id);
        for (k, v) in headers {
            frame = frame.header(*k, *v);
        }
        Delivery::new(frame.body(&b"payload"[..]))
    }

    fn session(
        ack_mode: AckMode,
        selector: Option<Selector>,
        capacity: usize,
    ) -> (Arc<ConsumerSession>, mpsc::Receiver<StompItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(ConsumerSession::new(
            Some("s1".to_string()),
            Destination::queue("a"),
            ack_mode,
            selector,
            None,
            tx,
            None,
        ));
        (session, rx)
    }

    #[tokio::test]
    async fn offer_rewrites_to_message_with_subscription() {
        let (session, mut rx) = session(AckMode::Client, None, 4);
        assert!(session.offer(delivery("m1", &[])));

        let StompItem::Frame(frame) = rx.recv().await.unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, command::MESSAGE);
        assert_eq!(frame.get(header::SUBSCRIPTION), Some("s1"));
        assert_eq!(frame.get(header::MESSAGE_ID), Some("m1"));
        assert_eq!(frame.get(header::DESTINATION), Some("/queue/a"));
        assert_eq!(session.pending_acks(), 1);
    }

    #[tokio::test]
    async fn full_sink_refuses_the_offer() {
        let (session, _rx) = session(AckMode::Client, None, 1);
        assert!(session.offer(delivery("m1", &[])));
        assert!(!session.offer(delivery("m2", &[])));
        // The refused delivery was never tracked.
        assert_eq!(session.pending_acks(), 1);
    }

    #[tokio::test]
    async fn closed_session_refuses_deliveries() {
        let (session, _rx) = session(AckMode::Auto, None, 4);
        session.close();
        assert!(!session.offer(delivery("m1", &[])));
    }

    #[tokio::test]
    async fn selector_filters_matches() {
        let selector = Selector::parse("color = 'red'").unwrap();
        let (session, _rx) = session(AckMode::Auto, Some(selector), 4);

        assert!(session.matches(&delivery("m1", &[("color", "red")])));
        assert!(!session.matches(&delivery("m2", &[("color", "blue")])));
        assert!(!session.matches(&delivery("m3", &[])));
    }

    #[tokio::test]
    async fn fallback_index_stays_in_lockstep() {
        let fallback: FallbackAckIndex = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(4);
        let session = ConsumerSession::new(
            None,
            Destination::queue("a"),
            AckMode::ClientIndividual,
            None,
            None,
            tx,
            Some(fallback.clone()),
        );
        assert_eq!(session.key(), "/queue/a");

        assert!(session.offer(delivery("m1", &[])));
        assert_eq!(
            fallback.lock().get("m1").map(String::as_str),
            Some("/queue/a")
        );

        session.perform_ack("m1", None).unwrap();
        assert!(fallback.lock().is_empty());
    }

    #[tokio::test]
    async fn auto_mode_skips_the_fallback_index() {
        let fallback: FallbackAckIndex = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(4);
        let session = ConsumerSession::new(
            None,
            Destination::queue("a"),
            AckMode::Auto,
            None,
            None,
            tx,
            Some(fallback.clone()),
        );
        assert!(session.offer(delivery("m1", &[])));
        assert!(fallback.lock().is_empty());
    }
}
