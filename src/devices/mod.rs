//! Device capability
//!
//! Every device variant the bridge can expose implements [`RemoteDevice`]
//! (instance side) and [`DeviceKind`] (class side: name, schema, factory).
//! Variants are made available through an explicit registration table,
//! [`DeviceClasses`], which maps a class name to its schema and factory.
//!
//! # Construction contract
//!
//! A factory receives a [`DeviceContext`] (definition, bridge settings and the
//! publish capability) and:
//!
//! 1. derives its identity and topic layout through [`DeviceCore`],
//! 2. declares the publish-only `state_topic` channel,
//! 3. declares its command channels with bound handlers,
//! 4. fails with [`DeviceError::MissingCapability`] when a hardware or OS
//!    capability it depends on is not available.
//!
//! The channel list is produced once and never changes afterwards.
//!
//! ```text
//! DeviceConfig ──► DeviceKind::build ──► RemoteDevice
//!                        │                   ├── DeviceCore (identity, topics, payload)
//!                        │                   └── [Channel] (topic, Option<Handler>)
//!                   Publisher
//! ```

pub mod arbitrary_sensor;
pub mod espeak_tts;
pub mod rpi_gpio;
pub mod rpi_rgb;
pub mod subprocess_call;
pub mod switch;

pub use arbitrary_sensor::ArbitrarySensor;
pub use espeak_tts::EspeakTts;
pub use rpi_gpio::RpiGpio;
pub use rpi_rgb::RpiRgb;
pub use subprocess_call::SubprocessCall;
pub use switch::Switch;

use crate::error::DeviceError;
use crate::mqtt::publisher::Publisher;
use crate::persistence::{BridgeSettings, DeviceConfig};
use crate::topics::{bridge_identifier, DeviceIdentity, DeviceNamespace};
use rumqttc::QoS;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};

pub const ON: &str = "ON";
pub const OFF: &str = "OFF";

/// Semantic type of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Boolean,
}

impl FieldType {
    pub fn matches(&self, value: &toml::Value) -> bool {
        matches!(
            (self, value),
            (FieldType::String, toml::Value::String(_))
                | (FieldType::Integer, toml::Value::Integer(_))
                | (FieldType::Boolean, toml::Value::Boolean(_))
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Boolean => write!(f, "boolean"),
        }
    }
}

/// Required fields of a device class and their expected types.
///
/// Always a superset of the base schema `{name: string, object_id: string}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceClassSchema(BTreeMap<&'static str, FieldType>);

impl DeviceClassSchema {
    pub fn base() -> Self {
        Self(BTreeMap::from([
            ("name", FieldType::String),
            ("object_id", FieldType::String),
        ]))
    }

    pub fn with(mut self, field: &'static str, field_type: FieldType) -> Self {
        self.0.insert(field, field_type);
        self
    }

    pub fn get(&self, field: &str) -> Option<FieldType> {
        self.0.get(field).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, FieldType)> + '_ {
        self.0.iter().map(|(name, ty)| (*name, *ty))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Callback bound to a writable channel, invoked with the decoded payload.
pub type Handler = Arc<dyn Fn(&str) -> Result<(), DeviceError> + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&str) -> Result<(), DeviceError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Name and sub topic of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelKind {
    pub name: &'static str,
    pub sub_topic: &'static str,
}

pub const STATE: ChannelKind = ChannelKind {
    name: "state_topic",
    sub_topic: "state",
};

pub const COMMAND: ChannelKind = ChannelKind {
    name: "command_topic",
    sub_topic: "set",
};

/// Every channel kind a built-in variant declares.
pub const CHANNEL_KINDS: [ChannelKind; 4] = [STATE, COMMAND, espeak_tts::SAY, rpi_rgb::RGB_STATE];

/// True when `sub_topic` is already used by a channel of some variant.
pub fn is_channel_sub_topic(sub_topic: &str) -> bool {
    CHANNEL_KINDS.iter().any(|kind| kind.sub_topic == sub_topic)
}

/// A named topic of a device, writable from the broker side when it has a handler.
#[derive(Clone)]
pub struct Channel {
    name: &'static str,
    topic: String,
    handler: Option<Handler>,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("writable", &self.is_writable())
            .finish()
    }
}

/// Discovery topic and self-description of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub topic: String,
    pub payload: Map<String, Value>,
}

impl DiscoveryDocument {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload)
    }
}

/// Everything a factory gets to build a device.
pub struct DeviceContext<'a> {
    pub object_id: &'a str,
    pub config: &'a DeviceConfig,
    pub settings: &'a BridgeSettings,
    pub publisher: Arc<dyn Publisher>,
}

/// State shared by every variant: identity, topic layout, discovery
/// attributes and the publish capability.
///
/// Immutable once built; variants keep it behind an `Arc` so their handlers
/// can publish.
pub struct DeviceCore {
    identity: DeviceIdentity,
    name: String,
    object_id: String,
    namespace: DeviceNamespace,
    attributes: Map<String, Value>,
    publisher: Arc<dyn Publisher>,
}

impl DeviceCore {
    /// Starts building the core of a `class_name` device announced under `public_class`.
    pub fn builder(
        ctx: &DeviceContext<'_>,
        class_name: &str,
        public_class: &str,
    ) -> DeviceCoreBuilder {
        let identity = DeviceIdentity::derive(ctx.settings, class_name, ctx.object_id);
        let namespace = DeviceNamespace::new(ctx.settings, public_class, &identity.id);

        let mut attributes = Map::new();
        attributes.insert(
            "device".to_string(),
            json!({
                "identifiers": [bridge_identifier(ctx.settings)],
                "name": ctx.settings.bridge_name,
            }),
        );
        attributes.insert("name".to_string(), json!(ctx.config.name()));
        attributes.insert("unique_id".to_string(), json!(identity.uid));
        attributes.insert("object_id".to_string(), json!(ctx.object_id));

        DeviceCoreBuilder {
            core: DeviceCore {
                identity,
                name: ctx.config.name().to_string(),
                object_id: ctx.object_id.to_string(),
                namespace,
                attributes,
                publisher: ctx.publisher.clone(),
            },
            optional: ctx.config.table_field("opt_attr").cloned(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn namespace(&self) -> &DeviceNamespace {
        &self.namespace
    }

    pub fn topic(&self, kind: ChannelKind) -> String {
        self.namespace.channel_topic(kind.sub_topic)
    }

    /// Declares a channel of this device.
    pub fn channel(&self, kind: ChannelKind, handler: Option<Handler>) -> Channel {
        Channel {
            name: kind.name,
            topic: self.topic(kind),
            handler,
        }
    }

    /// Publishes a plain-text message on a channel.
    pub fn update(&self, kind: ChannelKind, message: &str) -> Result<(), DeviceError> {
        self.publisher
            .publish(&self.topic(kind), message.to_string(), false, QoS::AtMostOnce)?;
        Ok(())
    }

    /// Publishes a message serialized as JSON on a channel.
    pub fn update_json<T: Serialize + ?Sized>(
        &self,
        kind: ChannelKind,
        message: &T,
    ) -> Result<(), DeviceError> {
        let payload = serde_json::to_string(message)?;
        self.update(kind, &payload)
    }

    /// Logs locally and mirrors the line onto the device log topic when logging is on.
    pub fn log_remote(&self, level: Level, message: &str) {
        let id = &self.identity.id;
        match level {
            Level::ERROR => error!("{}: {}", id, message),
            Level::WARN => warn!("{}: {}", id, message),
            Level::INFO => info!("{}: {}", id, message),
            _ => debug!("{}: {}", id, message),
        }

        if let Some(log_topic) = self.namespace.log_topic() {
            if let Err(e) =
                self.publisher
                    .publish(log_topic, message.to_string(), false, QoS::AtMostOnce)
            {
                warn!("{}: could not publish log line: {}", id, e);
            }
        }
    }

    /// Builds the discovery document: attributes plus the topic of every channel.
    pub fn discovery_document(&self, channels: &[Channel]) -> DiscoveryDocument {
        let mut payload = self.attributes.clone();
        for channel in channels {
            payload.insert(channel.name.to_string(), json!(channel.topic));
        }
        DiscoveryDocument {
            topic: self.namespace.discovery_topic(),
            payload,
        }
    }
}

impl fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCore")
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

pub struct DeviceCoreBuilder {
    core: DeviceCore,
    optional: Option<toml::Table>,
}

impl DeviceCoreBuilder {
    /// Adds a class-specific discovery attribute.
    pub fn attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.core.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Applies the optional `opt_attr` table and freezes the core.
    ///
    /// Optional attributes never replace an attribute the bridge sets itself.
    pub fn build(mut self) -> Arc<DeviceCore> {
        if let Some(optional) = self.optional.take() {
            for (key, value) in optional {
                if self.core.attributes.contains_key(&key) {
                    warn!(
                        "{}: optional attribute '{}' would overwrite a required item, skipped",
                        self.core.identity.id, key
                    );
                    continue;
                }
                match serde_json::to_value(&value) {
                    Ok(value) => {
                        self.core.attributes.insert(key, value);
                    }
                    Err(e) => warn!(
                        "{}: could not apply optional attribute '{}': {}",
                        self.core.identity.id, key, e
                    ),
                }
            }
        }
        Arc::new(self.core)
    }
}

/// Instance side of a device variant.
pub trait RemoteDevice: Send + Sync + 'static {
    fn core(&self) -> &DeviceCore;

    /// Channels declared at construction, fixed for the device's lifetime.
    fn channels(&self) -> &[Channel];

    fn as_any(&self) -> &dyn Any;

    fn identity(&self) -> &DeviceIdentity {
        self.core().identity()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn discovery_document(&self) -> DiscoveryDocument {
        self.core().discovery_document(self.channels())
    }
}

impl dyn RemoteDevice {
    pub fn downcast_ref<T: RemoteDevice>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Class side of a device variant.
pub trait DeviceKind: RemoteDevice + Sized {
    /// Name used as key in `remote_devices` and as prefix of the device id.
    const CLASS_NAME: &'static str;

    fn schema() -> DeviceClassSchema;

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError>;
}

type Factory = fn(&DeviceContext<'_>) -> Result<Arc<dyn RemoteDevice>, DeviceError>;

fn build_shared<T: DeviceKind>(ctx: &DeviceContext<'_>) -> Result<Arc<dyn RemoteDevice>, DeviceError> {
    Ok(Arc::new(T::build(ctx)?))
}

/// Registration entry of one device class.
#[derive(Clone)]
pub struct DeviceClass {
    name: &'static str,
    schema: fn() -> DeviceClassSchema,
    factory: Factory,
}

impl DeviceClass {
    pub fn of<T: DeviceKind>() -> Self {
        Self {
            name: T::CLASS_NAME,
            schema: T::schema,
            factory: build_shared::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn schema(&self) -> DeviceClassSchema {
        (self.schema)()
    }

    pub fn construct(&self, ctx: &DeviceContext<'_>) -> Result<Arc<dyn RemoteDevice>, DeviceError> {
        (self.factory)(ctx)
    }
}

impl fmt::Debug for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClass").field("name", &self.name).finish()
    }
}

/// Registration table mapping class names to their schema and factory.
#[derive(Debug, Clone)]
pub struct DeviceClasses(BTreeMap<&'static str, DeviceClass>);

impl DeviceClasses {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn register(&mut self, class: DeviceClass) {
        self.0.insert(class.name, class);
    }

    pub fn get(&self, name: &str) -> Option<&DeviceClass> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.keys().copied()
    }
}

impl Default for DeviceClasses {
    fn default() -> Self {
        supported_device_classes()
    }
}

/// Every device class this build supports.
pub fn supported_device_classes() -> DeviceClasses {
    let mut classes = DeviceClasses::empty();
    classes.register(DeviceClass::of::<ArbitrarySensor>());
    classes.register(DeviceClass::of::<RpiGpio>());
    classes.register(DeviceClass::of::<RpiRgb>());
    classes.register(DeviceClass::of::<EspeakTts>());
    classes.register(DeviceClass::of::<SubprocessCall>());
    classes.register(DeviceClass::of::<Switch>());
    classes
}

/// Reads a broker `ON`/`OFF` command.
pub(crate) fn parse_on_off(payload: &str) -> Result<bool, DeviceError> {
    match payload.trim() {
        ON => Ok(true),
        OFF => Ok(false),
        other => Err(DeviceError::InvalidCommand(format!(
            "expected ON or OFF, got '{}'",
            other
        ))),
    }
}

pub(crate) fn on_off(state: bool) -> &'static str {
    if state {
        ON
    } else {
        OFF
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mqtt::publisher::RecordingPublisher;
    use crate::persistence::tests::sample_settings;

    pub(crate) fn context<'a>(
        object_id: &'a str,
        config: &'a DeviceConfig,
        settings: &'a BridgeSettings,
        publisher: Arc<RecordingPublisher>,
    ) -> DeviceContext<'a> {
        DeviceContext {
            object_id,
            config,
            settings,
            publisher,
        }
    }

    #[test]
    fn test_every_schema_extends_base() {
        let base = DeviceClassSchema::base();
        let classes = supported_device_classes();
        let names: Vec<_> = classes.names().collect();
        assert_eq!(
            names,
            vec![
                "ArbitrarySensor",
                "ESpeakTTS",
                "RpiGpio",
                "RpiRgb",
                "SubprocessCall",
                "Switch"
            ]
        );

        for name in names {
            let schema = classes.get(name).unwrap().schema();
            assert!(schema.len() > base.len(), "{} adds no fields", name);
            for (field, ty) in base.fields() {
                assert_eq!(schema.get(field), Some(ty), "{} lacks {}", name, field);
            }
        }
    }

    #[test]
    fn test_discovery_document_contents() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = DeviceConfig::new()
            .with("name", "Kitchen")
            .with("object_id", "K1")
            .with("device_class", "switch");
        let ctx = context("K1", &config, &settings, publisher);

        let core = DeviceCore::builder(&ctx, "Switch", "switch")
            .attribute("icon", "mdi:toggle")
            .build();
        let channels = vec![core.channel(STATE, None)];
        let doc = core.discovery_document(&channels);

        assert_eq!(doc.topic, "homeassistant/switch/TestNode/Switch_K1/config");
        assert_eq!(doc.payload["name"], "Kitchen");
        assert_eq!(doc.payload["object_id"], "K1");
        assert_eq!(doc.payload["unique_id"], json!(core.identity().uid));
        assert_eq!(doc.payload["device"]["name"], "TestNode");
        assert_eq!(
            doc.payload["device"]["identifiers"][0],
            "device2mqtt_TestNode"
        );
        assert_eq!(
            doc.payload["state_topic"],
            "device2mqtt/TestNode/Switch_K1/state"
        );
        assert_eq!(doc.payload["icon"], "mdi:toggle");
    }

    #[test]
    fn test_optional_attributes_never_overwrite() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let mut optional = toml::Table::new();
        optional.insert("gen_attr".to_string(), "unrequired_info".into());
        optional.insert("unique_id".to_string(), "forged".into());
        let config = DeviceConfig::new()
            .with("name", "MyPin")
            .with("opt_attr", optional);
        let ctx = context("P5", &config, &settings, publisher);

        let core = DeviceCore::builder(&ctx, "Switch", "switch").build();
        let doc = core.discovery_document(&[]);

        assert_eq!(doc.payload["gen_attr"], "unrequired_info");
        assert_eq!(doc.payload["unique_id"], json!(core.identity().uid));
    }

    #[test]
    fn test_log_remote_only_with_logging() {
        let mut settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = DeviceConfig::new().with("name", "Dev");

        let quiet = DeviceCore::builder(
            &context("D1", &config, &settings, publisher.clone()),
            "Switch",
            "switch",
        )
        .build();
        quiet.log_remote(Level::INFO, "hello");
        assert!(publisher.messages().is_empty());

        settings.logging = true;
        let chatty = DeviceCore::builder(
            &context("D1", &config, &settings, publisher.clone()),
            "Switch",
            "switch",
        )
        .build();
        chatty.log_remote(Level::WARN, "hello");
        let sent = publisher.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "device2mqtt/TestNode/Switch_D1/log");
        assert_eq!(sent[0].payload, "hello");
        assert_eq!(sent[0].qos, QoS::AtMostOnce);
    }

    #[test]
    fn test_parse_on_off() {
        assert!(parse_on_off("ON").unwrap());
        assert!(!parse_on_off(" OFF\n").unwrap());
        assert!(matches!(
            parse_on_off("toggle"),
            Err(DeviceError::InvalidCommand(_))
        ));
    }
}
