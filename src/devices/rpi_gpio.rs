//! Raspberry Pi GPIO as switch or binary sensor
//!
//! `device_class = "switch"` drives an output pin from the command topic,
//! `device_class = "binary_sensor"` reports edges of an input pin. With
//! `inverted` set, the logical state is the opposite of the pin level in
//! both directions.

use super::{
    handler, on_off, parse_on_off, Channel, DeviceClassSchema, DeviceContext, DeviceCore,
    DeviceKind, FieldType, RemoteDevice, COMMAND, STATE,
};
use crate::error::DeviceError;
use crate::persistence::DeviceConfig;
use rppal::gpio::{Event, Gpio, InputPin, OutputPin, Trigger};
use std::any::Any;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn, Level};

const SWITCH: &str = "switch";
const BINARY_SENSOR: &str = "binary_sensor";

/// A digital output line.
pub trait PinOutput: Send {
    fn write(&mut self, high: bool);
}

impl PinOutput for OutputPin {
    fn write(&mut self, high: bool) {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

pub(crate) fn pin_field(config: &DeviceConfig, field: &str) -> Result<u8, DeviceError> {
    let raw = config.int_field(field)?;
    u8::try_from(raw).map_err(|_| DeviceError::InvalidField {
        field: field.to_string(),
        reason: format!("{} is not a valid BCM pin number", raw),
    })
}

pub(crate) fn open_gpio() -> Result<Gpio, DeviceError> {
    Gpio::new().map_err(|e| {
        DeviceError::MissingCapability(format!("GPIO peripheral is not available: {}", e))
    })
}

struct GpioState {
    core: Arc<DeviceCore>,
    inverted: bool,
    output: Option<Mutex<Box<dyn PinOutput>>>,
}

impl GpioState {
    /// Applies a broker command to the output pin and echoes the logical state.
    fn command(&self, payload: &str) -> Result<(), DeviceError> {
        let on = parse_on_off(payload)?;
        let Some(output) = &self.output else {
            return Err(DeviceError::InvalidCommand(
                "binary sensor can not be switched".to_string(),
            ));
        };

        output
            .lock()
            .map_err(|_| DeviceError::Hardware("output pin poisoned".to_string()))?
            .write(on != self.inverted);
        debug!("{} set to {}", self.core.identity().id, on_off(on));
        self.core.update(STATE, on_off(on))
    }

    /// Reports a level change of the input pin.
    fn level_changed(&self, high: bool) {
        let on = high != self.inverted;
        if let Err(e) = self.core.update(STATE, on_off(on)) {
            self.core
                .log_remote(Level::WARN, &format!("could not report pin change: {}", e));
        }
    }
}

pub struct RpiGpio {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
    state: Arc<GpioState>,
    _input: Option<Mutex<InputPin>>,
}

impl RpiGpio {
    /// Builds a switch around an arbitrary output line.
    pub fn switch_with_output(
        ctx: &DeviceContext<'_>,
        output: Box<dyn PinOutput>,
    ) -> Result<Self, DeviceError> {
        let inverted = ctx.config.bool_field("inverted")?;
        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, SWITCH).build();
        let state = Arc::new(GpioState {
            core: core.clone(),
            inverted,
            output: Some(Mutex::new(output)),
        });

        let command_state = state.clone();
        let channels = vec![
            core.channel(STATE, None),
            core.channel(
                COMMAND,
                Some(handler(move |payload| command_state.command(payload))),
            ),
        ];

        Ok(Self {
            core,
            channels,
            state,
            _input: None,
        })
    }

    fn binary_sensor(ctx: &DeviceContext<'_>, mut input: InputPin) -> Result<Self, DeviceError> {
        let inverted = ctx.config.bool_field("inverted")?;
        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, BINARY_SENSOR).build();
        let state = Arc::new(GpioState {
            core: core.clone(),
            inverted,
            output: None,
        });

        let edge_state = state.clone();
        input
            .set_async_interrupt(Trigger::Both, None, move |event: Event| {
                edge_state.level_changed(event.trigger == Trigger::RisingEdge);
            })
            .map_err(|e| DeviceError::Hardware(format!("could not watch input pin: {}", e)))?;

        let channels = vec![core.channel(STATE, None)];
        Ok(Self {
            core,
            channels,
            state,
            _input: Some(Mutex::new(input)),
        })
    }

    pub fn is_inverted(&self) -> bool {
        self.state.inverted
    }
}

impl RemoteDevice for RpiGpio {
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

impl DeviceKind for RpiGpio {
    const CLASS_NAME: &'static str = "RpiGpio";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base()
            .with("device_class", FieldType::String)
            .with("pin", FieldType::Integer)
            .with("inverted", FieldType::Boolean)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let mode = ctx.config.str_field("device_class")?;
        if mode != SWITCH && mode != BINARY_SENSOR {
            return Err(DeviceError::InvalidField {
                field: "device_class".to_string(),
                reason: format!("expected {} or {}, got '{}'", SWITCH, BINARY_SENSOR, mode),
            });
        }
        let pin_number = pin_field(ctx.config, "pin")?;

        let pin = open_gpio()?.get(pin_number).map_err(|e| {
            warn!("GPIO {} is not available: {}", pin_number, e);
            DeviceError::Hardware(format!("GPIO {}: {}", pin_number, e))
        })?;

        if mode == SWITCH {
            Self::switch_with_output(ctx, Box::new(pin.into_output()))
        } else {
            Self::binary_sensor(ctx, pin.into_input())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tests::context;
    use crate::mqtt::publisher::RecordingPublisher;
    use crate::persistence::tests::sample_settings;

    #[derive(Clone, Default)]
    struct FakePin(Arc<Mutex<Vec<bool>>>);

    impl PinOutput for FakePin {
        fn write(&mut self, high: bool) {
            self.0.lock().unwrap().push(high);
        }
    }

    fn gpio_config(inverted: bool) -> DeviceConfig {
        DeviceConfig::new()
            .with("name", "MyPin")
            .with("device_class", "switch")
            .with("pin", 4)
            .with("inverted", inverted)
    }

    #[test]
    fn test_switch_drives_pin() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = gpio_config(false);
        let pin = FakePin::default();
        let device = RpiGpio::switch_with_output(
            &context("GPIO_PIN4", &config, &settings, publisher.clone()),
            Box::new(pin.clone()),
        )
        .unwrap();

        let handler = device.channels()[1].handler().unwrap().clone();
        handler("ON").unwrap();
        handler("OFF").unwrap();

        assert_eq!(*pin.0.lock().unwrap(), vec![true, false]);
        let states: Vec<_> = publisher
            .messages_on("device2mqtt/TestNode/RpiGpio_GPIO_PIN4/state")
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(states, vec!["ON", "OFF"]);
    }

    #[test]
    fn test_inversion_is_symmetric() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = gpio_config(true);
        let pin = FakePin::default();
        let device = RpiGpio::switch_with_output(
            &context("GPIO_PIN4", &config, &settings, publisher.clone()),
            Box::new(pin.clone()),
        )
        .unwrap();
        assert!(device.is_inverted());

        device.channels()[1].handler().unwrap()("ON").unwrap();
        assert_eq!(*pin.0.lock().unwrap(), vec![false]);
        assert_eq!(publisher.messages()[0].payload, "ON");

        publisher.clear();
        device.state.level_changed(true);
        assert_eq!(publisher.messages()[0].payload, "OFF");
    }

    #[test]
    fn test_rejects_unknown_command() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = gpio_config(false);
        let pin = FakePin::default();
        let device = RpiGpio::switch_with_output(
            &context("GPIO_PIN4", &config, &settings, publisher.clone()),
            Box::new(pin.clone()),
        )
        .unwrap();

        let result = device.channels()[1].handler().unwrap()("HALF");
        assert!(matches!(result, Err(DeviceError::InvalidCommand(_))));
        assert!(pin.0.lock().unwrap().is_empty());
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_invalid_mode_and_pin() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());

        let config = gpio_config(false).with("device_class", "light");
        let result = RpiGpio::build(&context("P", &config, &settings, publisher.clone()));
        assert!(matches!(result, Err(DeviceError::InvalidField { .. })));

        let config = gpio_config(false).with("pin", 300);
        let result = RpiGpio::build(&context("P", &config, &settings, publisher));
        assert!(matches!(result, Err(DeviceError::InvalidField { .. })));
    }
}
