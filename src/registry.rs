//! Device registry and topic dispatch table
//!
//! Built once from the persisted configuration and read-only afterwards.
//! Devices are keyed by their hashed `uid`; the human readable `id` is kept as
//! a secondary lookup. Every declared channel ends up in the [`DispatchTable`]
//! under its exact topic string. Remote log topics are tracked beside the
//! table and may not coincide with any channel.

use crate::devices::{DeviceClasses, DeviceContext, Handler, RemoteDevice};
use crate::error::{DeviceError, RegistryError};
use crate::mqtt::publisher::Publisher;
use crate::persistence::PersistedConfig;
use crate::topics::check_level;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// What the dispatcher knows about one topic.
#[derive(Clone)]
pub struct DispatchEntry {
    /// `id` of the owning device
    pub device: String,
    pub channel: &'static str,
    pub handler: Option<Handler>,
}

/// Exact topic → optional handler, across all devices.
#[derive(Clone, Default)]
pub struct DispatchTable {
    entries: HashMap<String, DispatchEntry>,
}

impl DispatchTable {
    /// Adds a topic, failing when another channel already owns it.
    pub fn insert(&mut self, topic: &str, entry: DispatchEntry) -> Result<(), RegistryError> {
        if let Some(existing) = self.entries.get(topic) {
            return Err(RegistryError::DuplicateTopic {
                topic: topic.to_string(),
                first: existing.device.clone(),
                second: entry.device,
            });
        }
        self.entries.insert(topic.to_string(), entry);
        Ok(())
    }

    pub fn lookup(&self, topic: &str) -> Option<&DispatchEntry> {
        self.entries.get(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut topics: Vec<_> = self.topics().collect();
        topics.sort_unstable();
        f.debug_struct("DispatchTable").field("topics", &topics).finish()
    }
}

pub type DeviceMap = BTreeMap<String, Arc<dyn RemoteDevice>>;

pub struct DeviceRegistry {
    devices: DeviceMap,
    ids: HashMap<String, String>,
    table: DispatchTable,
    /// Remote log topic → owning device `id`
    log_topics: HashMap<String, String>,
}

impl DeviceRegistry {
    /// Constructs every configured device and folds its channels into the table.
    ///
    /// The first device that fails to construct aborts the build.
    pub fn build(
        config: &PersistedConfig,
        classes: &DeviceClasses,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self {
            devices: DeviceMap::new(),
            ids: HashMap::new(),
            table: DispatchTable::default(),
            log_topics: HashMap::new(),
        };

        for (device_class, object_id, definition) in config.devices() {
            let class = classes
                .get(device_class)
                .ok_or_else(|| RegistryError::UnsupportedDeviceClass(device_class.to_string()))?;

            check_level(object_id).map_err(|reason| RegistryError::Construction {
                device_class: device_class.to_string(),
                object_id: object_id.to_string(),
                source: DeviceError::InvalidField {
                    field: "object_id".to_string(),
                    reason,
                },
            })?;

            let ctx = DeviceContext {
                object_id,
                config: definition,
                settings: &config.bridge_settings,
                publisher: publisher.clone(),
            };
            let device = class
                .construct(&ctx)
                .map_err(|source| RegistryError::Construction {
                    device_class: device_class.to_string(),
                    object_id: object_id.to_string(),
                    source,
                })?;

            registry.insert(device)?;
        }

        info!(
            "Registry built with {} devices and {} channels",
            registry.devices.len(),
            registry.table.len()
        );
        Ok(registry)
    }

    fn insert(&mut self, device: Arc<dyn RemoteDevice>) -> Result<(), RegistryError> {
        let identity = device.identity().clone();
        if self.devices.contains_key(&identity.uid) {
            return Err(RegistryError::DuplicateUid {
                uid: identity.uid,
                id: identity.id,
            });
        }

        for channel in device.channels() {
            if let Some(owner) = self.log_topics.get(channel.topic()) {
                return Err(RegistryError::DuplicateTopic {
                    topic: channel.topic().to_string(),
                    first: owner.clone(),
                    second: identity.id,
                });
            }
            self.table.insert(
                channel.topic(),
                DispatchEntry {
                    device: identity.id.clone(),
                    channel: channel.name(),
                    handler: channel.handler().cloned(),
                },
            )?;
        }

        if let Some(log_topic) = device.core().namespace().log_topic() {
            if let Some(owner) = self.table.lookup(log_topic) {
                return Err(RegistryError::DuplicateTopic {
                    topic: log_topic.to_string(),
                    first: owner.device.clone(),
                    second: identity.id,
                });
            }
            self.log_topics
                .insert(log_topic.to_string(), identity.id.clone());
        }

        debug!(
            "Registered {} ({}) with {} channels",
            identity.id,
            identity.uid,
            device.channels().len()
        );
        self.ids.insert(identity.id, identity.uid.clone());
        self.devices.insert(identity.uid, device);
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Option<&Arc<dyn RemoteDevice>> {
        self.devices.get(uid)
    }

    pub fn by_id(&self, id: &str) -> Option<&Arc<dyn RemoteDevice>> {
        self.ids.get(id).and_then(|uid| self.devices.get(uid))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<dyn RemoteDevice>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    /// Splits into the uid keyed device map and the dispatch table.
    pub fn into_parts(self) -> (DeviceMap, DispatchTable) {
        (self.devices, self.table)
    }
}
