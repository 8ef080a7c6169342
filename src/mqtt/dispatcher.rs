//! Routing of inbound messages and the discovery lifecycle
//!
//! Lookup is by exact topic. A handler fault, whether an `Err` or a panic, is
//! logged with topic and payload and never reaches the caller, so one broken
//! device can not stop dispatch for the others.

use super::message_manager::InboundMessage;
use super::publisher::Publisher;
use crate::devices::RemoteDevice;
use crate::registry::{DeviceMap, DeviceRegistry, DispatchTable};
use rumqttc::QoS;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The channel handler accepted the payload
    Handled,
    /// The handler returned an error or panicked
    Faulted,
    /// Message on a publish-only channel, usually our own state update
    StateEcho,
    /// Message on a device log topic
    LogEcho,
    /// Topic below the bridge prefix that no device declared
    Unknown,
}

pub struct Dispatcher {
    devices: DeviceMap,
    table: DispatchTable,
    log_topics: HashSet<String>,
    publisher: Arc<dyn Publisher>,
}

impl Dispatcher {
    pub fn new(registry: DeviceRegistry, publisher: Arc<dyn Publisher>) -> Self {
        let (devices, table) = registry.into_parts();
        let log_topics = devices
            .values()
            .filter_map(|device| device.core().namespace().log_topic())
            .map(str::to_string)
            .collect();

        Self {
            devices,
            table,
            log_topics,
            publisher,
        }
    }

    pub fn device(&self, uid: &str) -> Option<&Arc<dyn RemoteDevice>> {
        self.devices.get(uid)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn RemoteDevice>> {
        self.devices.values()
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn dispatch(&self, message: &InboundMessage) -> DispatchOutcome {
        let topic = message.topic();
        let payload = message.payload();

        let Some(entry) = self.table.lookup(topic) else {
            if self.log_topics.contains(topic) {
                trace!("Log echo on {}", topic);
                return DispatchOutcome::LogEcho;
            }
            warn!("Message on unsubscribed channel {}", topic);
            return DispatchOutcome::Unknown;
        };

        let Some(handler) = &entry.handler else {
            debug!("{} echo of {}: {}", entry.channel, entry.device, payload);
            return DispatchOutcome::StateEcho;
        };

        debug!("Dispatching {} to {}", topic, entry.device);
        match panic::catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!(
                    "Handler of {} failed on {} with payload '{}': {}",
                    entry.device, topic, payload, e
                );
                DispatchOutcome::Faulted
            }
            Err(panic) => {
                error!(
                    "Handler of {} panicked on {} with payload '{}': {}",
                    entry.device,
                    topic,
                    payload,
                    panic_message(&*panic)
                );
                DispatchOutcome::Faulted
            }
        }
    }

    /// Publishes every discovery document. Returns how many were queued.
    pub fn announce_all(&self, retain: bool) -> usize {
        let mut announced = 0;
        for device in self.devices.values() {
            let document = device.discovery_document();
            let payload = match document.to_json() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Could not encode discovery of {}: {}", device.identity().id, e);
                    continue;
                }
            };
            match self
                .publisher
                .publish(&document.topic, payload, retain, QoS::AtLeastOnce)
            {
                Ok(()) => announced += 1,
                Err(e) => error!("Could not announce {}: {}", device.identity().id, e),
            }
        }
        info!("Announced {} of {} devices", announced, self.devices.len());
        announced
    }

    /// Publishes an empty retained payload on every discovery topic.
    pub fn retract_all(&self) -> usize {
        let mut retracted = 0;
        for device in self.devices.values() {
            let topic = device.core().namespace().discovery_topic();
            match self
                .publisher
                .publish(&topic, String::new(), true, QoS::AtLeastOnce)
            {
                Ok(()) => retracted += 1,
                Err(e) => error!("Could not retract {}: {}", device.identity().id, e),
            }
        }
        info!("Retracted {} of {} devices", retracted, self.devices.len());
        retracted
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{
        Channel, DeviceClass, DeviceClassSchema, DeviceClasses, DeviceContext, DeviceCore,
        DeviceKind, Switch, COMMAND, STATE,
    };
    use crate::error::DeviceError;
    use crate::mqtt::publisher::RecordingPublisher;
    use crate::persistence::tests::sample_settings;
    use crate::persistence::{DeviceConfig, PersistedConfig};

    /// Variant whose command handler panics on every message.
    struct Faulty {
        core: Arc<DeviceCore>,
        channels: Vec<Channel>,
    }

    impl RemoteDevice for Faulty {
        fn core(&self) -> &DeviceCore {
            &self.core
        }

        fn channels(&self) -> &[Channel] {
            &self.channels
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl DeviceKind for Faulty {
        const CLASS_NAME: &'static str = "Faulty";

        fn schema() -> DeviceClassSchema {
            DeviceClassSchema::base()
        }

        fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
            let core = DeviceCore::builder(ctx, Self::CLASS_NAME, "switch").build();
            let channels = vec![
                core.channel(STATE, None),
                core.channel(
                    COMMAND,
                    Some(crate::devices::handler(|payload| panic!("cannot handle {}", payload))),
                ),
            ];
            Ok(Self { core, channels })
        }
    }

    fn dispatcher(switches: usize, logging: bool) -> (Dispatcher, Arc<RecordingPublisher>) {
        let mut settings = sample_settings();
        settings.logging = logging;
        let mut config = PersistedConfig::new(settings);
        let entries = config.remote_devices.entry("Switch".to_string()).or_default();
        for i in 0..switches {
            entries.insert(
                format!("S{}", i),
                DeviceConfig::new()
                    .with("name", format!("Switch {}", i))
                    .with("device_class", "switch"),
            );
        }
        config
            .remote_devices
            .entry("Faulty".to_string())
            .or_default()
            .insert("F".to_string(), DeviceConfig::new().with("name", "Faulty"));

        let mut classes = DeviceClasses::default();
        classes.register(DeviceClass::of::<Faulty>());
        let publisher = Arc::new(RecordingPublisher::default());
        let registry = DeviceRegistry::build(&config, &classes, publisher.clone()).unwrap();
        (Dispatcher::new(registry, publisher.clone()), publisher)
    }

    fn switch<'a>(dispatcher: &'a Dispatcher, object_id: &str) -> &'a Switch {
        dispatcher
            .devices()
            .find(|d| d.core().object_id() == object_id)
            .and_then(|d| d.downcast_ref::<Switch>())
            .unwrap()
    }

    #[test]
    fn test_routes_commands_and_echoes() {
        let (dispatcher, publisher) = dispatcher(2, false);

        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S0/set",
            "ON",
        ));
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert!(switch(&dispatcher, "S0").is_on());
        assert!(!switch(&dispatcher, "S1").is_on());

        let echo = publisher.messages().pop().unwrap();
        assert_eq!(
            dispatcher.dispatch(&InboundMessage::from_topic(echo.topic, echo.payload)),
            DispatchOutcome::StateEcho
        );
    }

    #[test]
    fn test_unknown_topic_is_harmless() {
        let (dispatcher, publisher) = dispatcher(2, false);
        dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S1/set",
            "ON",
        ));
        publisher.clear();

        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S9/set",
            "OFF",
        ));
        assert_eq!(outcome, DispatchOutcome::Unknown);
        assert!(switch(&dispatcher, "S1").is_on());
        assert!(!switch(&dispatcher, "S0").is_on());
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_faults_are_contained() {
        let (dispatcher, _) = dispatcher(1, false);

        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Faulty_F/set",
            "boom",
        ));
        assert_eq!(outcome, DispatchOutcome::Faulted);

        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S0/set",
            "sideways",
        ));
        assert_eq!(outcome, DispatchOutcome::Faulted);

        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S0/set",
            "ON",
        ));
        assert_eq!(outcome, DispatchOutcome::Handled);
    }

    #[test]
    fn test_log_echo_is_dropped() {
        let (dispatcher, _) = dispatcher(1, true);
        let outcome = dispatcher.dispatch(&InboundMessage::from_topic(
            "device2mqtt/TestNode/Switch_S0/log",
            "hello",
        ));
        assert_eq!(outcome, DispatchOutcome::LogEcho);
    }

    #[test]
    fn test_retract_all() {
        let (dispatcher, publisher) = dispatcher(3, false);
        assert_eq!(dispatcher.retract_all(), 4);

        let sent = publisher.messages();
        assert_eq!(sent.len(), 4);
        let mut topics: Vec<_> = sent.iter().map(|m| m.topic.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();
        assert_eq!(topics.len(), 4);
        for message in &sent {
            assert!(message.payload.is_empty());
            assert!(message.topic.starts_with("homeassistant/switch/TestNode/"));
            assert!(message.topic.ends_with("/config"));
        }
    }

    #[test]
    fn test_announce_all() {
        let (dispatcher, publisher) = dispatcher(1, false);
        assert_eq!(dispatcher.announce_all(true), 2);
        assert_eq!(dispatcher.announce_all(false), 2);

        let sent = publisher.messages();
        assert!(sent[..2].iter().all(|m| m.retain));
        assert!(sent[2..].iter().all(|m| !m.retain));

        let doc = sent
            .iter()
            .find(|m| m.topic == "homeassistant/switch/TestNode/Switch_S0/config")
            .unwrap();
        let payload: serde_json::Value = serde_json::from_str(&doc.payload).unwrap();
        assert_eq!(payload["command_topic"], "device2mqtt/TestNode/Switch_S0/set");
        assert_eq!(payload["state_topic"], "device2mqtt/TestNode/Switch_S0/state");
        assert_eq!(payload["name"], "Switch 0");
    }
}
