//! RGB LED on three Raspberry Pi GPIO pins, announced as a JSON schema light

use super::rpi_gpio::{open_gpio, pin_field};
use super::{
    handler, on_off, Channel, ChannelKind, DeviceClassSchema, DeviceContext, DeviceCore,
    DeviceKind, FieldType, RemoteDevice, COMMAND, OFF, ON, STATE,
};
use crate::error::DeviceError;
use rppal::gpio::OutputPin;
use serde::Deserialize;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const RGB_STATE: ChannelKind = ChannelKind {
    name: "rgb_state_topic",
    sub_topic: "rgb_state",
};

const PWM_FREQUENCY_HZ: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn gray(level: u8) -> Self {
        Self {
            r: level,
            g: level,
            b: level,
        }
    }

    /// Reduces every channel to 0 or 1 for pins without intensity control.
    pub fn clamped(self) -> Self {
        let clamp = |v: u8| v.min(1);
        Self {
            r: clamp(self.r),
            g: clamp(self.g),
            b: clamp(self.b),
        }
    }

    pub fn is_off(&self) -> bool {
        *self == Self::OFF
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.r, self.g, self.b)
    }
}

/// Three output lines driven together.
pub trait RgbOutput: Send {
    fn apply(&mut self, color: Rgb) -> Result<(), DeviceError>;
}

/// [`RgbOutput`] on rppal pins, using software PWM when `pwm` is set.
pub struct GpioRgb {
    pins: [OutputPin; 3],
    active_high: bool,
    pwm: bool,
}

impl GpioRgb {
    fn drive(pin: &mut OutputPin, value: u8, active_high: bool, pwm: bool) -> Result<(), DeviceError> {
        if pwm {
            let duty = f64::from(value) / 255.0;
            let duty = if active_high { duty } else { 1.0 - duty };
            pin.set_pwm_frequency(PWM_FREQUENCY_HZ, duty)
                .map_err(|e| DeviceError::Hardware(format!("software PWM failed: {}", e)))
        } else {
            if (value > 0) == active_high {
                pin.set_high();
            } else {
                pin.set_low();
            }
            Ok(())
        }
    }
}

impl RgbOutput for GpioRgb {
    fn apply(&mut self, color: Rgb) -> Result<(), DeviceError> {
        let [r, g, b] = &mut self.pins;
        Self::drive(r, color.r, self.active_high, self.pwm)?;
        Self::drive(g, color.g, self.active_high, self.pwm)?;
        Self::drive(b, color.b, self.active_high, self.pwm)
    }
}

#[derive(Debug, Deserialize)]
struct LightCommand {
    state: String,
    color: Option<Rgb>,
    brightness: Option<f64>,
}

impl LightCommand {
    fn target(&self) -> Result<Rgb, DeviceError> {
        match self.state.as_str() {
            OFF => Ok(Rgb::OFF),
            ON => Ok(match (self.color, self.brightness) {
                (Some(color), _) => color,
                (None, Some(brightness)) => {
                    Rgb::gray((brightness.clamp(0.0, 1.0) * 255.0).round() as u8)
                }
                (None, None) => Rgb::gray(u8::MAX),
            }),
            other => Err(DeviceError::InvalidCommand(format!(
                "unsupported light state '{}'",
                other
            ))),
        }
    }
}

struct RgbState {
    core: Arc<DeviceCore>,
    pwm: bool,
    output: Mutex<Box<dyn RgbOutput>>,
    color: Mutex<Rgb>,
}

impl RgbState {
    fn command(&self, payload: &str) -> Result<(), DeviceError> {
        let command: LightCommand = serde_json::from_str(payload).map_err(|e| {
            DeviceError::InvalidCommand(format!("unsupported command structure {}: {}", payload, e))
        })?;
        let target = command.target()?;
        let target = if self.pwm { target } else { target.clamped() };

        self.output
            .lock()
            .map_err(|_| DeviceError::Hardware("RGB output poisoned".to_string()))?
            .apply(target)?;
        if let Ok(mut color) = self.color.lock() {
            *color = target;
        }
        debug!("{} set to {}", self.core.identity().id, target);

        self.core.update(RGB_STATE, &target.to_string())?;
        self.core.update(STATE, on_off(!target.is_off()))
    }
}

pub struct RpiRgb {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
    state: Arc<RgbState>,
}

impl RpiRgb {
    /// Builds the light around an arbitrary output.
    pub fn with_output(
        ctx: &DeviceContext<'_>,
        output: Box<dyn RgbOutput>,
    ) -> Result<Self, DeviceError> {
        let public_class = ctx.config.str_field("device_class")?;
        let pwm = ctx.config.bool_field("pwm_led")?;
        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, public_class)
            .attribute("schema", "json")
            .attribute("rgb", true)
            .build();

        let state = Arc::new(RgbState {
            core: core.clone(),
            pwm,
            output: Mutex::new(output),
            color: Mutex::new(Rgb::OFF),
        });

        let command_state = state.clone();
        let channels = vec![
            core.channel(STATE, None),
            core.channel(
                COMMAND,
                Some(handler(move |payload| command_state.command(payload))),
            ),
            core.channel(RGB_STATE, None),
        ];

        Ok(Self {
            core,
            channels,
            state,
        })
    }

    /// Last colour applied to the pins.
    pub fn color(&self) -> Rgb {
        self.state.color.lock().map(|c| *c).unwrap_or_default()
    }
}

impl RemoteDevice for RpiRgb {
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

impl DeviceKind for RpiRgb {
    const CLASS_NAME: &'static str = "RpiRgb";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base()
            .with("device_class", FieldType::String)
            .with("pin_r", FieldType::Integer)
            .with("pin_g", FieldType::Integer)
            .with("pin_b", FieldType::Integer)
            .with("active_high", FieldType::Boolean)
            .with("pwm_led", FieldType::Boolean)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let numbers = [
            pin_field(ctx.config, "pin_r")?,
            pin_field(ctx.config, "pin_g")?,
            pin_field(ctx.config, "pin_b")?,
        ];
        let active_high = ctx.config.bool_field("active_high")?;
        let pwm = ctx.config.bool_field("pwm_led")?;

        let gpio = open_gpio()?;
        let mut pins = Vec::with_capacity(3);
        for number in numbers {
            let pin = gpio
                .get(number)
                .map_err(|e| DeviceError::Hardware(format!("GPIO {}: {}", number, e)))?;
            pins.push(pin.into_output());
        }
        let pins: [OutputPin; 3] = pins
            .try_into()
            .map_err(|_| DeviceError::Hardware("expected three RGB pins".to_string()))?;

        let mut output = GpioRgb {
            pins,
            active_high,
            pwm,
        };
        output.apply(Rgb::OFF)?;
        Self::with_output(ctx, Box::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::tests::context;
    use crate::mqtt::publisher::RecordingPublisher;
    use crate::persistence::tests::sample_settings;
    use crate::persistence::DeviceConfig;

    #[derive(Clone, Default)]
    struct FakeRgb(Arc<Mutex<Vec<Rgb>>>);

    impl RgbOutput for FakeRgb {
        fn apply(&mut self, color: Rgb) -> Result<(), DeviceError> {
            self.0.lock().unwrap().push(color);
            Ok(())
        }
    }

    fn light(pwm: bool, publisher: Arc<RecordingPublisher>) -> (RpiRgb, FakeRgb) {
        let settings = sample_settings();
        let config = DeviceConfig::new()
            .with("name", "Desk")
            .with("device_class", "light")
            .with("pin_r", 17)
            .with("pin_g", 27)
            .with("pin_b", 22)
            .with("active_high", true)
            .with("pwm_led", pwm);
        let output = FakeRgb::default();
        let light = RpiRgb::with_output(
            &context("L1", &config, &settings, publisher),
            Box::new(output.clone()),
        )
        .unwrap();
        (light, output)
    }

    fn command(light: &RpiRgb, payload: &str) -> Result<(), DeviceError> {
        light.channels()[1].handler().unwrap()(payload)
    }

    #[test]
    fn test_discovery_marks_json_schema() {
        let (light, _) = light(false, Arc::new(RecordingPublisher::default()));
        let doc = light.discovery_document();
        assert_eq!(doc.payload["schema"], "json");
        assert_eq!(doc.payload["rgb"], true);
        assert_eq!(
            doc.payload["rgb_state_topic"],
            "device2mqtt/TestNode/RpiRgb_L1/rgb_state"
        );
        assert_eq!(doc.topic, "homeassistant/light/TestNode/RpiRgb_L1/config");
    }

    #[test]
    fn test_color_is_clamped_without_pwm() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (light, output) = light(false, publisher.clone());

        command(&light, r#"{"state":"ON","color":{"r":200,"g":0,"b":12}}"#).unwrap();
        assert_eq!(*output.0.lock().unwrap(), vec![Rgb { r: 1, g: 0, b: 1 }]);

        let rgb = publisher.messages_on("device2mqtt/TestNode/RpiRgb_L1/rgb_state");
        assert_eq!(rgb[0].payload, "1, 0, 1");
        let state = publisher.messages_on("device2mqtt/TestNode/RpiRgb_L1/state");
        assert_eq!(state[0].payload, "ON");
    }

    #[test]
    fn test_pwm_keeps_intensity() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (light, output) = light(true, publisher.clone());

        command(&light, r#"{"state":"ON","brightness":0.5}"#).unwrap();
        assert_eq!(light.color(), Rgb::gray(128));

        command(&light, r#"{"state":"OFF"}"#).unwrap();
        assert_eq!(output.0.lock().unwrap().last(), Some(&Rgb::OFF));
        let state = publisher.messages_on("device2mqtt/TestNode/RpiRgb_L1/state");
        assert_eq!(state.last().unwrap().payload, "OFF");
    }

    #[test]
    fn test_malformed_command() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (light, output) = light(true, publisher.clone());

        for payload in ["ON", r#"{"color":{"r":1,"g":1,"b":1}}"#, r#"{"state":"DIM"}"#] {
            assert!(matches!(
                command(&light, payload),
                Err(DeviceError::InvalidCommand(_))
            ));
        }
        assert!(output.0.lock().unwrap().is_empty());
        assert!(publisher.messages().is_empty());
    }
}
