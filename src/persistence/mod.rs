//! # Persistence Module
//!
//! ## Why This Module Exists
//! The bridge is driven entirely by one configuration document: the broker
//! connection and naming parameters, plus the definition of every device the
//! bridge exposes. This module holds the typed data model for that document
//! and the file I/O around it. The merge rules that change the document live
//! in [`config_merge`].
//!
//! ## Document Layout
//! ```toml
//! [bridge_settings]
//! ip = "192.168.0.10"
//! port = 1883
//! bridge_name = "garage"
//! discovery_prefix = "homeassistant"
//! operating_prefix = "device2mqtt"
//! logging = false
//!
//! [remote_devices.ArbitrarySensor.T1]
//! name = "Temp1"
//! object_id = "T1"
//! device_class = "temperature"
//! unit_of_measurement = "°C"
//! ```
//!
//! ## Error Handling Strategy
//! A bridge configuration has no sensible default: a missing or malformed
//! file is a [`ConfigError`] and the bridge does not start. Writes go through a sibling temporary file and a rename so a failed
//! write never leaves a truncated document behind.

pub mod config_merge;

use crate::devices::is_channel_sub_topic;
use crate::error::{ConfigError, DeviceError};
use crate::topics::check_level;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/device2mqtt";
const CONFIG_FILE: &str = "bridge.toml";
const DEFAULT_LOG_SUFFIX: &str = "log";

/// Devices grouped by class name, then keyed by object id.
pub type DeviceTable = BTreeMap<String, BTreeMap<String, DeviceConfig>>;

/// Connection and naming parameters of one bridge instance.
///
/// ## Usage Context
/// Read once at startup and never changed while the bridge runs. The merge
/// engine refuses to replace them in an existing document unless forced, so a
/// running fleet can not silently be re-pointed at another broker.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Broker host name or address
    pub ip: String,
    /// Broker port
    pub port: u16,
    /// Name of this bridge, part of every topic it owns
    pub bridge_name: String,
    /// Prefix of the discovery namespace (usually `homeassistant`)
    pub discovery_prefix: String,
    /// Prefix of the operating namespace for state and command topics
    pub operating_prefix: String,
    /// Broker user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Broker password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pw: Option<String>,
    /// Mirror device diagnostics onto a per-device log topic
    #[serde(default)]
    pub logging: bool,
    /// Last segment of the per-device log topic, `log` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_suffix: Option<String>,
}

impl BridgeSettings {
    /// Checks that every field needed to reach a broker and to build a topic
    /// namespace is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.ip.trim().is_empty() {
            missing.push("ip");
        }
        if self.port == 0 {
            missing.push("port");
        }
        if self.bridge_name.trim().is_empty() {
            missing.push("bridge_name");
        }
        if self.discovery_prefix.trim().is_empty() {
            missing.push("discovery_prefix");
        }
        if self.operating_prefix.trim().is_empty() {
            missing.push("operating_prefix");
        }

        if !missing.is_empty() {
            return Err(ConfigError::Configuration(format!(
                "missing bridge settings: {}",
                missing.join(", ")
            )));
        }

        let mut invalid = Vec::new();
        for (field, value) in [
            ("bridge_name", &self.bridge_name),
            ("discovery_prefix", &self.discovery_prefix),
            ("operating_prefix", &self.operating_prefix),
        ] {
            if let Err(reason) = check_level(value) {
                invalid.push(format!("{} {}", field, reason));
            }
        }
        if let Some(suffix) = &self.log_suffix {
            if let Err(reason) = check_level(suffix) {
                invalid.push(format!("log_suffix {}", reason));
            } else if is_channel_sub_topic(suffix) {
                invalid.push(format!("log_suffix '{}' is a channel sub topic", suffix));
            }
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Configuration(format!(
                "invalid bridge settings: {}",
                invalid.join(", ")
            )))
        }
    }

    /// Suffix of the per-device log topic, or `None` when remote logging is off.
    pub fn log_suffix(&self) -> Option<&str> {
        if !self.logging {
            return None;
        }
        Some(self.log_suffix.as_deref().unwrap_or(DEFAULT_LOG_SUFFIX))
    }

    /// Wildcard filter covering the operating namespace of every device of this bridge.
    pub fn node_filter(&self) -> String {
        format!("{}/{}/#", self.operating_prefix, self.bridge_name)
    }
}

/// Definition of one device instance as stored in the configuration.
///
/// Always carries `name`, `object_id` and `device_class` once it passed the
/// merge engine; everything else depends on the device class. Values are kept
/// as dynamic TOML values and read through the typed getters, which report a
/// missing or mistyped field as [`DeviceError::InvalidField`].
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct DeviceConfig(toml::Table);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for assembling definitions in code.
    pub fn with(mut self, field: &str, value: impl Into<toml::Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&toml::Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &toml::Value)> {
        self.0.iter()
    }

    pub(crate) fn insert(&mut self, field: &str, value: impl Into<toml::Value>) {
        self.0.insert(field.to_string(), value.into());
    }

    /// Display name, empty when absent.
    pub fn name(&self) -> &str {
        self.0.get("name").and_then(|v| v.as_str()).unwrap_or_default()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.0.get("object_id").and_then(|v| v.as_str())
    }

    pub fn device_class(&self) -> Option<&str> {
        self.0.get("device_class").and_then(|v| v.as_str())
    }

    pub fn str_field(&self, field: &str) -> Result<&str, DeviceError> {
        match self.0.get(field) {
            Some(toml::Value::String(s)) => Ok(s),
            other => Err(invalid_field(field, "a string", other)),
        }
    }

    pub fn int_field(&self, field: &str) -> Result<i64, DeviceError> {
        match self.0.get(field) {
            Some(toml::Value::Integer(i)) => Ok(*i),
            other => Err(invalid_field(field, "an integer", other)),
        }
    }

    pub fn bool_field(&self, field: &str) -> Result<bool, DeviceError> {
        match self.0.get(field) {
            Some(toml::Value::Boolean(b)) => Ok(*b),
            other => Err(invalid_field(field, "a boolean", other)),
        }
    }

    /// Optional nested table, e.g. `opt_attr`.
    pub fn table_field(&self, field: &str) -> Option<&toml::Table> {
        self.0.get(field).and_then(|v| v.as_table())
    }
}

impl From<toml::Table> for DeviceConfig {
    fn from(table: toml::Table) -> Self {
        Self(table)
    }
}

fn invalid_field(field: &str, expected: &str, found: Option<&toml::Value>) -> DeviceError {
    let reason = match found {
        Some(value) => format!("expected {}, found {}", expected, value.type_str()),
        None => format!("expected {}, field is missing", expected),
    };
    DeviceError::InvalidField {
        field: field.to_string(),
        reason,
    }
}

/// The complete configuration document.
///
/// ## Invariant
/// `object_id` is unique within a device class (guaranteed by the map keys).
/// Entries are only ever added or, when forced, replaced; never removed.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PersistedConfig {
    pub bridge_settings: BridgeSettings,
    #[serde(default)]
    pub remote_devices: DeviceTable,
}

impl PersistedConfig {
    pub fn new(bridge_settings: BridgeSettings) -> Self {
        Self {
            bridge_settings,
            remote_devices: DeviceTable::new(),
        }
    }

    /// Reads and parses the document at `path`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config: PersistedConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(
            "Loaded configuration from {} with {} devices",
            path.display(),
            config.device_count()
        );
        Ok(config)
    }

    /// Serializes the document and replaces `path` atomically.
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp_path = sibling_tmp_path(path);
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: tmp_path.clone(),
                source,
            })?;

        if let Err(source) = tokio::fs::rename(&tmp_path, path).await {
            if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
                warn!("Could not clean up {}: {}", tmp_path.display(), e);
            }
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }

        info!("Configuration written to {}", path.display());
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.remote_devices.values().map(BTreeMap::len).sum()
    }

    /// Every `(device_class, object_id, definition)` in stable order.
    pub fn devices(&self) -> impl Iterator<Item = (&str, &str, &DeviceConfig)> {
        self.remote_devices.iter().flat_map(|(class, devices)| {
            devices
                .iter()
                .map(move |(object_id, config)| (class.as_str(), object_id.as_str(), config))
        })
    }

    pub fn get(&self, device_class: &str, object_id: &str) -> Option<&DeviceConfig> {
        self.remote_devices.get(device_class)?.get(object_id)
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| CONFIG_FILE.into());
    file_name.push(".tmp");
    path.with_file_name(file_name)
}

/// Default location of the configuration document, `~/.config/device2mqtt/bridge.toml`.
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
