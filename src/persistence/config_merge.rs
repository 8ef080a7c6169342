//! Validated merge of device definitions into the persisted configuration
//!
//! Rules:
//! - a fresh configuration needs complete bridge settings,
//! - bridge settings of an existing configuration are only replaced with `force`,
//! - every definition is checked against its class schema,
//! - an object id must be usable as a single topic level,
//! - an existing `(device_class, object_id)` is only replaced with `force`, and
//!   only that entry is touched,
//! - nothing is written unless the whole batch passes.

use super::{BridgeSettings, DeviceConfig, DeviceTable, PersistedConfig};
use crate::devices::{DeviceClassSchema, DeviceClasses};
use crate::error::ConfigError;
use crate::topics::check_level;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};

const OPTIONAL_ATTRIBUTES: &str = "opt_attr";

/// What a successful merge changed, as `(device_class, object_id)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<(String, String)>,
    pub replaced: Vec<(String, String)>,
}

impl MergeReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty()
    }
}

/// Devices to merge, as read from a file in the configuration layout.
///
/// ```toml
/// [remote_devices.Switch.S1]
/// name = "Fan"
/// device_class = "switch"
/// ```
///
/// `bridge_settings` is optional and only needed to create a new configuration.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct MergeRequest {
    #[serde(default)]
    pub bridge_settings: Option<BridgeSettings>,
    #[serde(default)]
    pub remote_devices: DeviceTable,
}

impl MergeRequest {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Runs [`update_config`] with this request against the configuration at `path`.
    pub async fn apply(
        self,
        path: &Path,
        force: bool,
        classes: &DeviceClasses,
    ) -> Result<MergeReport, ConfigError> {
        update_config(self.remote_devices, path, self.bridge_settings, force, classes).await
    }
}

/// Merges `proposed` into the configuration at `path` and persists the result.
///
/// `bridge_settings` is mandatory when `path` does not exist yet. For an
/// existing file it is only accepted together with `force`.
pub async fn update_config(
    proposed: DeviceTable,
    path: &Path,
    bridge_settings: Option<BridgeSettings>,
    force: bool,
    classes: &DeviceClasses,
) -> Result<MergeReport, ConfigError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut config = if exists {
        let mut config = PersistedConfig::load(path).await?;
        if let Some(settings) = bridge_settings {
            if !force {
                return Err(ConfigError::BridgeSettingsLocked(path.to_path_buf()));
            }
            settings.validate()?;
            if settings != config.bridge_settings {
                warn!("Replacing bridge settings of {}", path.display());
            }
            config.bridge_settings = settings;
        }
        config
    } else {
        let settings = bridge_settings.ok_or_else(|| {
            ConfigError::Configuration(format!(
                "no configuration at {} and no bridge settings given",
                path.display()
            ))
        })?;
        settings.validate()?;
        info!("Creating new configuration at {}", path.display());
        PersistedConfig::new(settings)
    };

    let report = merge_devices(&mut config, proposed, force, classes)?;
    config.save(path).await?;

    info!(
        "Configuration merged: {} added, {} replaced",
        report.added.len(),
        report.replaced.len()
    );
    Ok(report)
}

/// Validates the whole batch, then merges it into `config`.
///
/// On error `config` is unchanged.
pub fn merge_devices(
    config: &mut PersistedConfig,
    proposed: DeviceTable,
    force: bool,
    classes: &DeviceClasses,
) -> Result<MergeReport, ConfigError> {
    let mut validated = Vec::new();
    for (device_class, devices) in proposed {
        let schema = classes
            .get(&device_class)
            .ok_or_else(|| ConfigError::UnsupportedDeviceClass(device_class.clone()))?
            .schema();

        for (object_id, definition) in devices {
            let definition = validate_device(&device_class, &object_id, definition, &schema)?;
            validated.push((device_class.clone(), object_id, definition));
        }
    }

    let mut report = MergeReport::default();
    for (device_class, object_id, _) in &validated {
        let key = (device_class.clone(), object_id.clone());
        if config.get(device_class, object_id).is_none() {
            report.added.push(key);
        } else if force {
            report.replaced.push(key);
        } else {
            return Err(ConfigError::DuplicateDevice {
                device_class: device_class.clone(),
                object_id: object_id.clone(),
            });
        }
    }

    for (device_class, object_id, definition) in validated {
        debug!("Merging {}/{}", device_class, object_id);
        config
            .remote_devices
            .entry(device_class)
            .or_default()
            .insert(object_id, definition);
    }
    Ok(report)
}

/// Checks one definition against its schema and fills in `object_id` from the key.
pub fn validate_device(
    device_class: &str,
    object_id: &str,
    mut definition: DeviceConfig,
    schema: &DeviceClassSchema,
) -> Result<DeviceConfig, ConfigError> {
    let invalid = |field: &str, reason: String| ConfigError::Validation {
        device_class: device_class.to_string(),
        object_id: object_id.to_string(),
        field: field.to_string(),
        reason,
    };

    check_level(object_id).map_err(|reason| invalid("object_id", reason))?;

    match definition.get("object_id") {
        None => definition.insert("object_id", object_id),
        Some(toml::Value::String(declared)) if declared == object_id => {}
        Some(toml::Value::String(declared)) => {
            return Err(invalid(
                "object_id",
                format!("is '{}' but the definition is keyed '{}'", declared, object_id),
            ))
        }
        Some(other) => {
            return Err(invalid(
                "object_id",
                format!("expected string, found {}", other.type_str()),
            ))
        }
    }

    for (field, expected) in schema.fields() {
        match definition.get(field) {
            None => return Err(invalid(field, "is missing".to_string())),
            Some(value) if !expected.matches(value) => {
                return Err(invalid(
                    field,
                    format!("expected {}, found {}", expected, value.type_str()),
                ))
            }
            Some(_) => {}
        }
    }

    if let Some(value) = definition.get(OPTIONAL_ATTRIBUTES) {
        if !value.is_table() {
            return Err(invalid(
                OPTIONAL_ATTRIBUTES,
                format!("expected table, found {}", value.type_str()),
            ));
        }
    }

    Ok(definition)
}
