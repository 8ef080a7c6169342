//! Publish capability handed to every device
//!
//! Devices never talk to the broker client directly. They publish through the
//! [`Publisher`] trait, which the bridge backs with an outbox: publishes are
//! queued on an unbounded channel and a transport task performs the actual
//! async publish. Queueing never blocks, so handlers stay non-blocking and
//! publishes made before the connection is up are delivered once it is.

use crate::error::PublishError;
use rumqttc::QoS;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// One queued outbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub qos: QoS,
}

/// Capability to publish a message on the broker.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: String, retain: bool, qos: QoS)
        -> Result<(), PublishError>;
}

/// [`Publisher`] feeding the transport's outbound queue.
#[derive(Clone)]
pub struct OutboxPublisher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    pending: Arc<AtomicUsize>,
}

impl OutboxPublisher {
    /// Creates the publisher together with the queue the transport drains.
    pub fn channel() -> (Self, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                pending: pending.clone(),
            },
            Outbox {
                rx,
                held: None,
                pending,
            },
        )
    }
}

/// Receiving end of the outbound queue.
///
/// Counts messages that were queued but not yet handed to the broker client.
/// A message stays pending until [`Outbox::delivered`] is called for it or
/// the [`InFlight`] guard taken for it is dropped.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    held: Option<OutboundMessage>,
    pending: Arc<AtomicUsize>,
}

impl Outbox {
    /// Next message; one put back with [`Outbox::hold`] comes first.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        if let Some(message) = self.held.take() {
            return Some(message);
        }
        self.rx.recv().await
    }

    /// Puts back a message that was taken but not handed over. It stays pending.
    pub fn hold(&mut self, message: OutboundMessage) {
        self.held = Some(message);
    }

    pub fn delivered(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Guard for a message being handed over, marks it delivered when dropped.
    pub fn in_flight(&self) -> InFlight {
        InFlight {
            pending: Some(self.pending.clone()),
        }
    }

    /// Shared counter of pending messages, readable while the outbox is being drained.
    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        self.pending.clone()
    }
}

/// Settles the pending count of one message even if the task handing it over
/// is aborted.
#[derive(Debug)]
pub struct InFlight {
    pending: Option<Arc<AtomicUsize>>,
}

impl InFlight {
    /// The message went back to the outbox and is still pending.
    pub fn requeued(mut self) {
        self.pending = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Publisher for OutboxPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: String,
        retain: bool,
        qos: QoS,
    ) -> Result<(), PublishError> {
        trace!("Queueing publish on {}", topic);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(OutboundMessage {
                topic: topic.to_string(),
                payload,
                retain,
                qos,
            })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                PublishError::Closed
            })
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingPublisher;

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Test double remembering every publish.
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingPublisher {
        pub(crate) fn messages(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn messages_on(&self, topic: &str) -> Vec<OutboundMessage> {
            self.messages()
                .into_iter()
                .filter(|m| m.topic == topic)
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(
            &self,
            topic: &str,
            payload: String,
            retain: bool,
            qos: QoS,
        ) -> Result<(), PublishError> {
            self.sent.lock().unwrap().push(OutboundMessage {
                topic: topic.to_string(),
                payload,
                retain,
                qos,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_queues_in_order() {
        let (publisher, mut rx) = OutboxPublisher::channel();
        let pending = rx.pending_counter();
        publisher
            .publish("a/state", "ON".to_string(), false, QoS::AtMostOnce)
            .unwrap();
        publisher
            .publish("a/config", String::new(), true, QoS::AtLeastOnce)
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "a/state");
        assert_eq!(first.payload, "ON");
        assert_eq!(pending.load(Ordering::SeqCst), 2);
        rx.delivered();

        let second = rx.recv().await.unwrap();
        assert!(second.retain);
        assert_eq!(second.qos, QoS::AtLeastOnce);
        rx.delivered();
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_outbox_closed() {
        let (publisher, rx) = OutboxPublisher::channel();
        let pending = rx.pending_counter();
        drop(rx);
        assert_eq!(
            publisher.publish("a", String::new(), false, QoS::AtMostOnce),
            Err(PublishError::Closed)
        );
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_held_message_comes_first_and_stays_pending() {
        let (publisher, mut rx) = OutboxPublisher::channel();
        let pending = rx.pending_counter();
        publisher
            .publish("a/first", String::new(), false, QoS::AtMostOnce)
            .unwrap();
        publisher
            .publish("a/second", String::new(), false, QoS::AtMostOnce)
            .unwrap();

        let first = rx.recv().await.unwrap();
        rx.in_flight().requeued();
        rx.hold(first);
        assert_eq!(pending.load(Ordering::SeqCst), 2);

        assert_eq!(rx.recv().await.unwrap().topic, "a/first");
        drop(rx.in_flight());
        assert_eq!(pending.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap().topic, "a/second");
    }
}
