//! Error definitions for the bridge
//!
//! Each concern gets its own enum so callers can match on what actually went
//! wrong: configuration merges ([`ConfigError`]), registry construction
//! ([`RegistryError`]), device construction and handler faults
//! ([`DeviceError`]), the publish capability ([`PublishError`]) and the
//! bridge lifecycle ([`BridgeError`]).

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading, validating or merging the persisted configuration
///
/// All of them abort the operation that raised them. The merge engine never
/// writes a partial file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Bridge settings are missing or incomplete
    ///
    /// Raised when a fresh configuration is created without bridge settings
    /// or when a required connection field is empty.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A device definition does not satisfy its class schema
    #[error("Validation error for {device_class}/{object_id}: field '{field}' {reason}")]
    Validation {
        device_class: String,
        object_id: String,
        field: String,
        reason: String,
    },

    /// The device already exists and the merge was not forced
    #[error("Device {device_class}/{object_id} already exists, refusing to replace it without force")]
    DuplicateDevice {
        device_class: String,
        object_id: String,
    },

    /// No device class with this name is registered
    #[error("Unsupported device class: {0}")]
    UnsupportedDeviceClass(String),

    /// Bridge settings were supplied for an existing configuration without force
    #[error("Bridge settings of the existing configuration {0} can not be changed without force")]
    BridgeSettingsLocked(PathBuf),

    /// Reading or writing the configuration file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or does not match the layout
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The merged configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors raised while building the device registry
///
/// Any of these aborts the whole build. The bridge never starts with a
/// partially initialised set of devices.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configuration names a device class that is not registered
    #[error("Unsupported device class: {0}")]
    UnsupportedDeviceClass(String),

    /// A device variant failed to initialise
    #[error("Could not construct {device_class}/{object_id}: {source}")]
    Construction {
        device_class: String,
        object_id: String,
        #[source]
        source: DeviceError,
    },

    /// Two devices derived the same unique id
    #[error("Duplicate device uid {uid} ({id})")]
    DuplicateUid { uid: String, id: String },

    /// Two channels resolved to the same topic
    #[error("Topic {topic} is claimed by both {first} and {second}")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },
}

/// Errors raised by device variants
///
/// During construction they surface as [`RegistryError::Construction`].
/// Returned from a channel handler they are a handler fault: the dispatcher
/// logs them and keeps going.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A hardware or OS capability the variant needs is not available on this host
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// A configuration field has a value the variant can not use
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// An inbound command could not be interpreted
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The device is busy and rejects the command instead of queueing it
    #[error("Device busy: {0}")]
    Busy(String),

    /// The publish capability is gone
    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    /// Spawning or controlling a child process failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The GPIO driver reported an error
    #[error("Hardware error: {0}")]
    Hardware(String),
}

/// Errors of the publish capability
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The outbound queue has been dropped
    #[error("Outbound queue is closed")]
    Closed,
}

/// Errors of the bridge lifecycle
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The pub/sub transport failed to connect or subscribe
    #[error("Transport error: {0}")]
    Transport(String),

    /// Building the registry failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Loading the configuration failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}
