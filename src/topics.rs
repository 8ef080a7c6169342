//! Topic namespace
//!
//! Pure functions deriving the identity and the topic layout of a device from
//! the bridge settings, the implementing device class and the object id:
//!
//! ```text
//! id        = {device_class}_{object_id}
//! uid       = sha1("{operating_prefix}_{bridge_name}_{device_class}_{object_id}")[..16]
//! discovery = {discovery_prefix}/{public_class}/{bridge_name}/{id}/
//! operating = {operating_prefix}/{bridge_name}/{id}/
//! ```
//!
//! Every input ends up as exactly one topic level. [`check_level`] is what the
//! merge engine and the bridge settings use to reject values that would not.

use crate::persistence::BridgeSettings;
use sha1::{Digest, Sha1};

/// Number of hex characters kept from the SHA-1 digest.
pub const UID_LEN: usize = 16;

const DISCOVERY_SUFFIX: &str = "config";

/// Level separator and filter wildcards.
const RESERVED_CHARS: [char; 3] = ['/', '+', '#'];

/// Checks that `value` can stand as a single topic level.
///
/// Returns the reason when it can not: an empty value, a level separator or a
/// wildcard would change the shape of every topic built from it.
pub fn check_level(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err("is empty".to_string());
    }
    match value.chars().find(|c| RESERVED_CHARS.contains(c)) {
        Some(c) => Err(format!("contains '{}', which is not allowed in a topic level", c)),
        None => Ok(()),
    }
}

/// Identity of a device within a bridge.
///
/// `id` is human readable and unique within the bridge, `uid` is the hashed
/// form embedded in discovery payloads. Both are recomputed on every registry
/// build and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub id: String,
    pub uid: String,
}

impl DeviceIdentity {
    pub fn derive(settings: &BridgeSettings, device_class: &str, object_id: &str) -> Self {
        Self {
            id: device_id(device_class, object_id),
            uid: device_uid(settings, device_class, object_id),
        }
    }
}

pub fn device_id(device_class: &str, object_id: &str) -> String {
    format!("{}_{}", device_class, object_id)
}

pub fn device_uid(settings: &BridgeSettings, device_class: &str, object_id: &str) -> String {
    let uid_string = format!(
        "{}_{}_{}_{}",
        settings.operating_prefix, settings.bridge_name, device_class, object_id
    );
    let digest = Sha1::digest(uid_string.as_bytes());
    let mut uid = hex::encode(digest);
    uid.truncate(UID_LEN);
    uid
}

/// Identifier of the bridge itself, used as device-group identifier in discovery payloads.
pub fn bridge_identifier(settings: &BridgeSettings) -> String {
    format!("{}_{}", settings.operating_prefix, settings.bridge_name)
}

/// Topic layout of one device.
///
/// `public_class` is the broker-side category the device announces under. It
/// may differ from the semantic class stored in the payload: an arbitrary
/// sensor always announces as `sensor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNamespace {
    discovery_prefix: String,
    operating_prefix: String,
    log_topic: Option<String>,
}

impl DeviceNamespace {
    pub fn new(settings: &BridgeSettings, public_class: &str, id: &str) -> Self {
        let discovery_prefix = format!(
            "{}/{}/{}/{}/",
            settings.discovery_prefix, public_class, settings.bridge_name, id
        );
        let operating_prefix = format!(
            "{}/{}/{}/",
            settings.operating_prefix, settings.bridge_name, id
        );
        let log_topic = settings
            .log_suffix()
            .map(|suffix| format!("{}{}", operating_prefix, suffix));

        Self {
            discovery_prefix,
            operating_prefix,
            log_topic,
        }
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    pub fn operating_prefix(&self) -> &str {
        &self.operating_prefix
    }

    /// Topic the discovery document is published on.
    pub fn discovery_topic(&self) -> String {
        format!("{}{}", self.discovery_prefix, DISCOVERY_SUFFIX)
    }

    /// Topic of a channel below the operating prefix.
    pub fn channel_topic(&self, sub_topic: &str) -> String {
        format!("{}{}", self.operating_prefix, sub_topic)
    }

    /// Remote log topic, present only when logging is enabled.
    pub fn log_topic(&self) -> Option<&str> {
        self.log_topic.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_settings;

    #[test]
    fn test_identity_is_deterministic() {
        let settings = sample_settings();
        let first = DeviceIdentity::derive(&settings, "ArbitrarySensor", "T1");
        let second = DeviceIdentity::derive(&settings, "ArbitrarySensor", "T1");

        assert_eq!(first, second);
        assert_eq!(first.id, "ArbitrarySensor_T1");
        assert_eq!(first.uid.len(), UID_LEN);
        assert!(first.uid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uid_matches_sha1_prefix() {
        let settings = sample_settings();
        let uid = device_uid(&settings, "ArbitrarySensor", "T1");

        let digest = Sha1::digest(b"device2mqtt_TestNode_ArbitrarySensor_T1");
        assert_eq!(uid, hex::encode(digest)[..UID_LEN]);
    }

    #[test]
    fn test_uid_differs_per_object_and_class() {
        let settings = sample_settings();
        let a = device_uid(&settings, "ArbitrarySensor", "T1");
        let b = device_uid(&settings, "ArbitrarySensor", "T2");
        let c = device_uid(&settings, "Switch", "T1");
        assert_ne!(a, b);
        assert_ne!(a, c);

        let mut other_bridge = sample_settings();
        other_bridge.bridge_name = "OtherNode".to_string();
        assert_ne!(a, device_uid(&other_bridge, "ArbitrarySensor", "T1"));
    }

    #[test]
    fn test_namespace_layout() {
        let settings = sample_settings();
        let ns = DeviceNamespace::new(&settings, "sensor", "ArbitrarySensor_T1");

        assert_eq!(
            ns.discovery_topic(),
            "homeassistant/sensor/TestNode/ArbitrarySensor_T1/config"
        );
        assert_eq!(
            ns.channel_topic("state"),
            "device2mqtt/TestNode/ArbitrarySensor_T1/state"
        );
        assert_eq!(ns.log_topic(), None);
        assert!(ns
            .channel_topic("set")
            .starts_with(settings.node_filter().trim_end_matches('#')));
    }

    #[test]
    fn test_log_topic_when_logging() {
        let mut settings = sample_settings();
        settings.logging = true;
        let ns = DeviceNamespace::new(&settings, "switch", "Switch_S1");

        assert_eq!(ns.log_topic(), Some("device2mqtt/TestNode/Switch_S1/log"));
        assert_eq!(bridge_identifier(&settings), "device2mqtt_TestNode");
    }

    #[test]
    fn test_check_level() {
        assert!(check_level("T1").is_ok());
        assert!(check_level("living_room-2").is_ok());

        assert_eq!(check_level("  "), Err("is empty".to_string()));
        for bad in ["a/b", "a+", "#", "a/+/#"] {
            let reason = check_level(bad).unwrap_err();
            assert!(reason.contains("not allowed"), "{}: {}", bad, reason);
        }
    }
}
