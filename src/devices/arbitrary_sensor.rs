//! Publish-only sensor for arbitrary values
//!
//! Announces under the generic `sensor` category while carrying its real
//! semantic class (temperature, current, ...) in the discovery payload.

use super::{
    Channel, DeviceClassSchema, DeviceContext, DeviceCore, DeviceKind, FieldType, RemoteDevice,
    STATE,
};
use crate::error::DeviceError;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::{Arc, Mutex};

const PUBLIC_CLASS: &str = "sensor";
const VALUE_TEMPLATE: &str = "{{ value_json.value }}";

pub struct ArbitrarySensor {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
    last_value: Mutex<Option<Value>>,
}

impl ArbitrarySensor {
    /// Publishes `{"value": value}` on the state channel.
    ///
    /// A value equal to the last published one is skipped unless `force` is
    /// set. Returns whether a message was published.
    pub fn set_value(&self, value: impl Into<Value>, force: bool) -> Result<bool, DeviceError> {
        let value = value.into();
        let mut last_value = self
            .last_value
            .lock()
            .map_err(|_| DeviceError::Hardware("sensor state poisoned".to_string()))?;

        if !force && last_value.as_ref() == Some(&value) {
            return Ok(false);
        }

        self.core.update_json(STATE, &json!({ "value": value }))?;
        *last_value = Some(value);
        Ok(true)
    }

    pub fn last_value(&self) -> Option<Value> {
        self.last_value.lock().ok().and_then(|v| v.clone())
    }
}

impl RemoteDevice for ArbitrarySensor {
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

impl DeviceKind for ArbitrarySensor {
    const CLASS_NAME: &'static str = "ArbitrarySensor";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base()
            .with("device_class", FieldType::String)
            .with("unit_of_measurement", FieldType::String)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let device_class = ctx.config.str_field("device_class")?;
        let unit = ctx.config.str_field("unit_of_measurement")?;

        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, PUBLIC_CLASS)
            .attribute("device_class", device_class)
            .attribute("unit_of_measurement", unit)
            .attribute("value_template", VALUE_TEMPLATE)
            .build();
        let channels = vec![core.channel(STATE, None)];

        Ok(Self {
            core,
            channels,
            last_value: Mutex::new(None),
        })
    }
}
