//! Pub/sub transport boundary
//!
//! The bridge only needs four things from a broker connection: connect and
//! hand back a stream of inbound messages, subscribe to a filter, wait until
//! queued publishes are out, and disconnect. Publishing itself goes through the
//! [`Publisher`](super::publisher::Publisher) outbox, which the transport drains.
//!
//! [`MqttTransport`] runs two tasks per session:
//!
//! ```text
//!   EventLoop::poll ──► ConnAck: (re)subscribe every filter
//!                  └──► Publish: InboundMessage ──► mpsc ──► bridge
//!   Outbox::recv   ──► AsyncClient::publish
//! ```
//!
//! On disconnect the drain is cancelled and awaited. A message whose publish
//! was still waiting for room in the client queue is held back in the outbox,
//! so the pending count stays exact and the next session sends it first.
//!
//! Polling and publishing are split so a full client request queue can never
//! stall the event loop that empties it.

use super::config::MqttConfig;
use super::message_manager::InboundMessage;
use super::publisher::Outbox;
use crate::error::BridgeError;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const FLUSH_POLL: Duration = Duration::from_millis(20);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

pub trait Transport: Send + 'static {
    /// Opens a session and returns its inbound message stream.
    ///
    /// Calling it again replaces the previous session.
    fn connect(&mut self) -> Result<mpsc::Receiver<InboundMessage>, BridgeError>;

    /// Subscribes to `filter`, now and after every reconnect.
    fn subscribe(&mut self, filter: &str) -> Result<(), BridgeError>;

    /// Waits until every queued publish was handed to the connection.
    /// Returns `false` on timeout.
    fn flush(&self, timeout: Duration) -> TransportFuture<'_, bool>;

    /// Ends the session. Publishes still queued stay queued for the next one.
    fn disconnect(&mut self) -> TransportFuture<'_, ()>;
}

#[derive(Default)]
struct Subscriptions {
    filters: Vec<String>,
    connected: bool,
}

impl Subscriptions {
    fn subscribe_all(&self, client: &AsyncClient) {
        for filter in &self.filters {
            match client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                Ok(()) => debug!("Subscribed to {}", filter),
                Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
            }
        }
    }
}

struct Session {
    client: AsyncClient,
    cancel: CancellationToken,
    /// Child of `cancel`, stops only the outbox drain
    drain_cancel: CancellationToken,
    poll_task: JoinHandle<()>,
    drain_task: JoinHandle<()>,
}

/// [`Transport`] on a rumqttc client.
pub struct MqttTransport {
    config: MqttConfig,
    outbox: Arc<tokio::sync::Mutex<Outbox>>,
    pending: Arc<AtomicUsize>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    session: Option<Session>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig, outbox: Outbox) -> Self {
        let pending = outbox.pending_counter();
        Self {
            config,
            outbox: Arc::new(tokio::sync::Mutex::new(outbox)),
            pending,
            subscriptions: Arc::new(Mutex::new(Subscriptions::default())),
            session: None,
        }
    }

    fn end_session(&mut self) -> Option<Session> {
        let session = self.session.take()?;
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.connected = false;
        }
        Some(session)
    }
}

impl Transport for MqttTransport {
    fn connect(&mut self) -> Result<mpsc::Receiver<InboundMessage>, BridgeError> {
        if let Some(previous) = self.end_session() {
            debug!("Replacing previous broker session");
            previous.cancel.cancel();
        }

        info!(
            "Connecting to {}:{} as {}",
            self.config.host, self.config.port, self.config.client_id
        );
        let (client, eventloop) =
            AsyncClient::new(self.config.options(), self.config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.channel_capacity);
        let cancel = CancellationToken::new();
        let drain_cancel = cancel.child_token();

        let poll_task = tokio::spawn(poll_events(
            eventloop,
            client.clone(),
            self.subscriptions.clone(),
            inbound_tx,
            cancel.clone(),
            self.config.retry_delay,
        ));
        let drain_task = tokio::spawn(drain_outbox(
            client.clone(),
            self.outbox.clone(),
            drain_cancel.clone(),
        ));

        self.session = Some(Session {
            client,
            cancel,
            drain_cancel,
            poll_task,
            drain_task,
        });
        Ok(inbound_rx)
    }

    fn subscribe(&mut self, filter: &str) -> Result<(), BridgeError> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| BridgeError::Transport("subscription list poisoned".to_string()))?;
        if !subscriptions.filters.iter().any(|f| f == filter) {
            subscriptions.filters.push(filter.to_string());
        }

        // Otherwise the next ConnAck subscribes.
        if subscriptions.connected {
            if let Some(session) = &self.session {
                session
                    .client
                    .try_subscribe(filter, QoS::AtMostOnce)
                    .map_err(|e| BridgeError::Transport(format!("subscribe {}: {}", filter, e)))?;
            }
        }
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> TransportFuture<'_, bool> {
        let pending = self.pending.clone();
        Box::pin(async move {
            let drained = tokio::time::timeout(timeout, async {
                while pending.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(FLUSH_POLL).await;
                }
            })
            .await;
            drained.is_ok()
        })
    }

    fn disconnect(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let Some(session) = self.end_session() else {
                return;
            };

            // A publish cut short goes back to the outbox for the next session.
            session.drain_cancel.cancel();
            let mut drain_task = session.drain_task;
            if tokio::time::timeout(DISCONNECT_GRACE, &mut drain_task)
                .await
                .is_err()
            {
                warn!("Outbox drain did not stop in time");
                drain_task.abort();
            }

            if let Err(e) = session.client.try_disconnect() {
                debug!("Could not queue disconnect: {}", e);
                session.cancel.cancel();
            }

            // The poll task ends once the disconnect went out.
            let mut poll_task = session.poll_task;
            if tokio::time::timeout(DISCONNECT_GRACE, &mut poll_task)
                .await
                .is_err()
            {
                warn!("Broker did not take the disconnect in time");
                session.cancel.cancel();
                poll_task.abort();
            }
            info!("Disconnected from broker");
        })
    }
}

async fn poll_events(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Subscriptions>>,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    retry_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to broker ({:?})", ack.code);
                if let Ok(mut subscriptions) = subscriptions.lock() {
                    subscriptions.connected = true;
                    subscriptions.subscribe_all(&client);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::from_publish(&publish);
                trace!("Received {}", message);
                if inbound.send(message).await.is_err() {
                    debug!("Inbound stream closed, stopping event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(other) => trace!("MQTT event: {:?}", other),
            Err(e) => {
                if let Ok(mut subscriptions) = subscriptions.lock() {
                    subscriptions.connected = false;
                }
                warn!(
                    "MQTT connection error: {}, retrying in {:?}",
                    e, retry_delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
        }
    }
    if let Ok(mut subscriptions) = subscriptions.lock() {
        subscriptions.connected = false;
    }
}

async fn drain_outbox(
    client: AsyncClient,
    outbox: Arc<tokio::sync::Mutex<Outbox>>,
    cancel: CancellationToken,
) {
    let mut outbox = tokio::select! {
        _ = cancel.cancelled() => return,
        outbox = outbox.lock_owned() => outbox,
    };

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbox.recv() => message,
        };
        let Some(message) = message else {
            debug!("Outbox closed");
            break;
        };

        trace!("Publishing on {}", message.topic);
        let in_flight = outbox.in_flight();
        let result = tokio::select! {
            biased;
            result = client.publish(
                message.topic.clone(),
                message.qos,
                message.retain,
                message.payload.clone().into_bytes(),
            ) => result,
            _ = cancel.cancelled() => {
                debug!("Publish on {} interrupted, holding it back", message.topic);
                in_flight.requeued();
                outbox.hold(message);
                break;
            }
        };
        if let Err(e) = result {
            error!("Failed to publish on {}: {}", message.topic, e);
        }
        drop(in_flight);
    }
}

#[cfg(test)]
pub(crate) use channel::ChannelTransport;
