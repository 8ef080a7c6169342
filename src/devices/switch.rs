//! Virtual switch without any backing hardware
//!
//! Holds an ON/OFF state that automations can flip through the command topic
//! and local code can flip through [`Switch::set_value`].

use super::{
    handler, on_off, Channel, DeviceClassSchema, DeviceContext, DeviceCore, DeviceKind, FieldType,
    RemoteDevice, COMMAND, STATE,
};
use crate::error::DeviceError;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct SwitchState {
    core: Arc<DeviceCore>,
    on: AtomicBool,
}

impl SwitchState {
    fn apply(&self, on: bool) -> Result<(), DeviceError> {
        self.on.store(on, Ordering::SeqCst);
        debug!("{} switched {}", self.core.identity().id, on_off(on));
        self.core.update(STATE, on_off(on))
    }
}

pub struct Switch {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
    state: Arc<SwitchState>,
}

impl Switch {
    /// Sets and publishes the state.
    ///
    /// Accepts `"ON"`/`"OFF"` (any case), booleans and numbers, where any
    /// non-zero number is ON. `null` means OFF.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), DeviceError> {
        let on = interpret(&value.into())?;
        self.state.apply(on)
    }

    pub fn is_on(&self) -> bool {
        self.state.on.load(Ordering::SeqCst)
    }

    /// Current state as broker text.
    pub fn value(&self) -> &'static str {
        on_off(self.is_on())
    }
}

fn interpret(value: &Value) -> Result<bool, DeviceError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "TRUE" | "1" => Ok(true),
            "OFF" | "FALSE" | "0" => Ok(false),
            other => Err(DeviceError::InvalidCommand(format!(
                "can not switch to '{}'",
                other
            ))),
        },
        other => Err(DeviceError::InvalidCommand(format!(
            "can not switch to {}",
            other
        ))),
    }
}

impl RemoteDevice for Switch {
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

impl DeviceKind for Switch {
    const CLASS_NAME: &'static str = "Switch";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base().with("device_class", FieldType::String)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let public_class = ctx.config.str_field("device_class")?;
        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, public_class).build();

        let state = Arc::new(SwitchState {
            core: core.clone(),
            on: AtomicBool::new(false),
        });

        let command_state = state.clone();
        let channels = vec![
            core.channel(STATE, None),
            core.channel(
                COMMAND,
                Some(handler(move |payload| {
                    command_state.apply(interpret(&Value::String(payload.to_string()))?)
                })),
            ),
        ];

        Ok(Self {
            core,
            channels,
            state,
        })
    }
}
