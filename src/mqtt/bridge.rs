//! Bridge lifecycle with statum state machine
//!
//! Owns the dispatcher and the transport and walks them through the
//! connection lifecycle with compile-time state safety. Inbound messages are
//! dispatched one at a time in arrival order.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connected ──► Subscribed ──► Running ──► Stopped
//!                     ▲                                       │
//!                     └───────────────(reconnect)─────────────┘
//! ```
//!
//! Discovery announce and retract are available in every state; their
//! publishes are queued and go out once a session is up.

use super::dispatcher::{DispatchOutcome, Dispatcher};
use super::message_manager::InboundMessage;
use super::publisher::Publisher;
use super::transport::Transport;
use crate::devices::DeviceClasses;
use crate::error::BridgeError;
use crate::persistence::{BridgeSettings, PersistedConfig};
use crate::registry::DeviceRegistry;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// States of the bridge lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum BridgeState {
    Disconnected, // Registry built, no broker session
    Connected,    // Session open, inbound stream available
    Subscribed,   // Node wildcard subscribed
    Running,      // Dispatching inbound messages
    Stopped,      // Message loop halted, may reconnect
}

#[machine]
pub struct Bridge<S: BridgeState> {
    settings: BridgeSettings,
    dispatcher: Dispatcher,
    transport: Box<dyn Transport>,
    inbound: Option<mpsc::Receiver<InboundMessage>>,
}

impl<S: BridgeState> Bridge<S> {
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Publishes every device's discovery document.
    pub fn announce_all(&self, retain: bool) -> usize {
        self.dispatcher.announce_all(retain)
    }

    /// Removes every device from the broker-side registry.
    pub fn retract_all(&self) -> usize {
        self.dispatcher.retract_all()
    }

    /// Waits until queued publishes were handed to the transport.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let flushed = self.transport.flush(timeout).await;
        if !flushed {
            warn!("Outbox not drained within {:?}", timeout);
        }
        flushed
    }
}

impl Bridge<Disconnected> {
    /// Builds the registry from `config`; fails if any device fails.
    pub fn create(
        config: &PersistedConfig,
        classes: &DeviceClasses,
        publisher: Arc<dyn Publisher>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        config.bridge_settings.validate()?;
        info!(
            "Initializing bridge {} with {} configured devices",
            config.bridge_settings.bridge_name,
            config.device_count()
        );

        let registry = DeviceRegistry::build(config, classes, publisher.clone())?;
        let dispatcher = Dispatcher::new(registry, publisher);

        Ok(Self::new(
            config.bridge_settings.clone(),
            dispatcher,
            transport,
            None, // inbound
        ))
    }

    pub fn connect(mut self) -> Result<Bridge<Connected>, BridgeError> {
        info!("Connecting bridge {}", self.settings.bridge_name);
        self.inbound = Some(self.transport.connect()?);
        Ok(self.transition())
    }
}

impl Bridge<Connected> {
    /// Subscribes to the wildcard covering every device's operating namespace.
    pub fn subscribe(mut self) -> Result<Bridge<Subscribed>, BridgeError> {
        let filter = self.settings.node_filter();
        self.transport.subscribe(&filter)?;
        info!("Subscribed to {}", filter);
        Ok(self.transition())
    }

    pub async fn disconnect(mut self) -> Bridge<Disconnected> {
        self.inbound = None;
        self.transport.disconnect().await;
        self.transition()
    }
}

impl Bridge<Subscribed> {
    pub fn start(self) -> Bridge<Running> {
        info!("Bridge {} running", self.settings.bridge_name);
        self.transition()
    }
}

impl Bridge<Running> {
    /// Dispatches inbound messages until shutdown or until the transport closes the stream.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Bridge<Stopped> {
        let Some(mut inbound) = self.inbound.take() else {
            error!("Bridge is running without an inbound stream");
            return self.transition();
        };

        let mut handled = 0usize;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for {}", self.settings.bridge_name);
                    break;
                }

                message = inbound.recv() => match message {
                    Some(message) => {
                        if self.dispatcher.dispatch(&message) == DispatchOutcome::Handled {
                            handled += 1;
                        }
                    }
                    None => {
                        warn!("Inbound stream closed by transport");
                        break;
                    }
                },
            }
        }

        debug!("Message loop ended after {} handled commands", handled);
        self.transition()
    }

    pub fn stop(mut self) -> Bridge<Stopped> {
        info!("Stopping bridge {}", self.settings.bridge_name);
        self.inbound = None;
        self.transition()
    }
}

impl Bridge<Stopped> {
    /// Opens a fresh session; the subscription has to be issued again.
    pub fn reconnect(mut self) -> Result<Bridge<Connected>, BridgeError> {
        info!("Reconnecting bridge {}", self.settings.bridge_name);
        self.inbound = Some(self.transport.connect()?);
        Ok(self.transition())
    }

    pub async fn close(mut self) {
        self.transport.disconnect().await;
        info!("Bridge {} closed", self.settings.bridge_name);
    }
}

/// Handle for a running bridge in a tokio task
pub struct BridgeHandle {
    pub name: String,
    task_handle: Option<JoinHandle<Bridge<Stopped>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl BridgeHandle {
    pub fn spawn(bridge: Bridge<Running>) -> Self {
        let name = bridge.settings.bridge_name.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_name = name.clone();
        let task_handle = tokio::spawn(async move {
            debug!("Spawning running bridge: {}", task_name);
            bridge.run_until_shutdown(shutdown_rx).await
        });

        Self {
            name,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stops the message loop and hands back the stopped bridge.
    pub async fn shutdown(&mut self) -> Result<Bridge<Stopped>, BridgeError> {
        debug!("Sending shutdown signal to bridge: {}", self.name);

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Bridge task already terminated: {}", self.name);
            }
        }

        self.join().await
    }

    /// Waits for the message loop to end on its own.
    pub async fn join(&mut self) -> Result<Bridge<Stopped>, BridgeError> {
        let handle = self.task_handle.take().ok_or_else(|| {
            BridgeError::Transport(format!("bridge {} already shut down", self.name))
        })?;

        handle.await.map_err(|e| {
            error!("Bridge task panicked: {} - {}", self.name, e);
            BridgeError::Transport(format!("bridge task failed: {}", e))
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }
}
