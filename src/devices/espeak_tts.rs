//! Text to speech through the `espeak` executable

use super::{
    handler, Channel, ChannelKind, DeviceClassSchema, DeviceContext, DeviceCore, DeviceKind,
    FieldType, RemoteDevice, STATE,
};
use crate::error::DeviceError;
use serde_json::Value;
use std::any::Any;
use std::process::Stdio;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn, Level};

pub const SAY: ChannelKind = ChannelKind {
    name: "command_topic",
    sub_topic: "say",
};

const ESPEAK: &str = "espeak";

/// Something that can speak a line of text without blocking the caller.
pub trait SpeechSynthesizer: Send + Sync {
    fn say(&self, text: &str) -> Result<(), DeviceError>;
}

/// Runs one `espeak` process per utterance, reaped on a background task.
#[derive(Debug, Clone)]
pub struct EspeakProcess {
    voice: String,
    rate: i64,
    pitch: i64,
    runtime: Handle,
}

impl EspeakProcess {
    /// Checks that `espeak` can be executed and a runtime is available to reap it.
    ///
    /// The version check blocks. On a multi-threaded runtime it runs through
    /// `block_in_place` so the worker hands its other tasks off first.
    pub fn detect(voice: &str, rate: i64, pitch: i64) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| {
            DeviceError::MissingCapability("speech needs a running tokio runtime".to_string())
        })?;

        let version = || {
            std::process::Command::new(ESPEAK)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
        };
        let status = match runtime.runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(version),
            _ => version(),
        }
        .map_err(|e| {
            DeviceError::MissingCapability(format!("{} is not executable: {}", ESPEAK, e))
        })?;
        if !status.success() {
            return Err(DeviceError::MissingCapability(format!(
                "{} --version exited with {}",
                ESPEAK, status
            )));
        }

        Ok(Self {
            voice: voice.to_string(),
            rate,
            pitch,
            runtime,
        })
    }

    fn arguments(&self, text: &str) -> Vec<String> {
        vec![
            "-v".to_string(),
            self.voice.clone(),
            "-s".to_string(),
            self.rate.to_string(),
            "-p".to_string(),
            self.pitch.to_string(),
            text.to_string(),
        ]
    }
}

impl SpeechSynthesizer for EspeakProcess {
    fn say(&self, text: &str) -> Result<(), DeviceError> {
        let _guard = self.runtime.enter();
        let mut child = tokio::process::Command::new(ESPEAK)
            .args(self.arguments(text))
            .stdout(Stdio::null())
            .spawn()?;

        self.runtime.spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => debug!("{} finished", ESPEAK),
                Ok(status) => warn!("{} exited with {}", ESPEAK, status),
                Err(e) => warn!("Could not wait for {}: {}", ESPEAK, e),
            }
        });
        Ok(())
    }
}

/// Reads the text of a say command: `{"text": ...}`, a JSON string or raw text.
fn text_of(payload: &str) -> Result<String, DeviceError> {
    let text = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(DeviceError::InvalidCommand(
                    "no text key provided in message".to_string(),
                ))
            }
        },
        Ok(Value::String(text)) => text,
        _ => payload.to_string(),
    };

    if text.trim().is_empty() {
        return Err(DeviceError::InvalidCommand("nothing to say".to_string()));
    }
    Ok(text)
}

pub struct EspeakTts {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
}

impl EspeakTts {
    /// Builds the speaker around an arbitrary synthesizer.
    pub fn with_synthesizer(
        ctx: &DeviceContext<'_>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Result<Self, DeviceError> {
        let public_class = ctx.config.str_field("device_class")?;
        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, public_class)
            .attribute("schema", "json")
            .build();

        let say_core = core.clone();
        let channels = vec![
            core.channel(STATE, None),
            core.channel(
                SAY,
                Some(handler(move |payload| {
                    let text = text_of(payload)?;
                    say_core.log_remote(Level::DEBUG, &format!("saying '{}'", text));
                    synthesizer.say(&text)?;
                    say_core.update(STATE, &text)
                })),
            ),
        ];

        Ok(Self { core, channels })
    }
}

impl RemoteDevice for EspeakTts {
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

impl DeviceKind for EspeakTts {
    const CLASS_NAME: &'static str = "ESpeakTTS";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base()
            .with("device_class", FieldType::String)
            .with("voice", FieldType::String)
            .with("rate", FieldType::Integer)
            .with("pitch", FieldType::Integer)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let synthesizer = EspeakProcess::detect(
            ctx.config.str_field("voice")?,
            ctx.config.int_field("rate")?,
            ctx.config.int_field("pitch")?,
        )?;
        Self::with_synthesizer(ctx, Arc::new(synthesizer))
    }
}
