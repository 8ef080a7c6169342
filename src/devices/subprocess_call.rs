//! Switch backed by a subprocess
//!
//! `ON` starts the configured program and the state stays `ON` until the
//! process exits. A watcher task per run polls the child every `looptime`
//! seconds and publishes `OFF` once it is gone. `OFF` kills the child. Only one
//! run at a time: a second `ON` is rejected, never queued.

use super::{
    handler, parse_on_off, Channel, DeviceClassSchema, DeviceContext, DeviceCore, DeviceKind,
    FieldType, RemoteDevice, COMMAND, OFF, ON, STATE,
};
use crate::error::DeviceError;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn, Level};

struct Run {
    generation: u64,
    kill: Option<oneshot::Sender<()>>,
}

struct ProcessState {
    core: Arc<DeviceCore>,
    program: String,
    arguments: Vec<String>,
    looptime: Duration,
    runtime: Handle,
    running: Mutex<Option<Run>>,
    generation: AtomicU64,
}

impl ProcessState {
    fn slot(&self) -> Result<MutexGuard<'_, Option<Run>>, DeviceError> {
        self.running
            .lock()
            .map_err(|_| DeviceError::Hardware("process slot poisoned".to_string()))
    }

    fn command(self: &Arc<Self>, payload: &str) -> Result<(), DeviceError> {
        if parse_on_off(payload)? {
            self.start()
        } else {
            self.stop()
        }
    }

    fn start(self: &Arc<Self>) -> Result<(), DeviceError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            self.core.log_remote(
                Level::WARN,
                "subprocess is still running, multirun not supported",
            );
            return Err(DeviceError::Busy(self.core.identity().id.clone()));
        }

        let child = {
            let _guard = self.runtime.enter();
            Command::new(&self.program)
                .args(&self.arguments)
                .kill_on_drop(true)
                .spawn()?
        };
        debug!(
            "{} started {} (pid {:?})",
            self.core.identity().id,
            self.program,
            child.id()
        );

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (kill_tx, kill_rx) = oneshot::channel();
        *slot = Some(Run {
            generation,
            kill: Some(kill_tx),
        });
        self.runtime
            .spawn(self.clone().watch(child, generation, kill_rx));

        self.core.update(STATE, ON)
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let mut slot = self.slot()?;
        let kill = slot.as_mut().and_then(|run| run.kill.take());
        match kill {
            Some(kill) => {
                // The watcher may have seen the exit already.
                let _ = kill.send(());
            }
            None if slot.is_some() => debug!("{} is already stopping", self.core.identity().id),
            None => self.core.log_remote(Level::INFO, "process already stopped"),
        }
        Ok(())
    }

    async fn watch(self: Arc<Self>, mut child: Child, generation: u64, mut kill: oneshot::Receiver<()>) {
        let mut poll = tokio::time::interval(self.looptime);
        loop {
            tokio::select! {
                _ = &mut kill => {
                    if let Err(e) = child.kill().await {
                        warn!("{}: could not kill process: {}", self.core.identity().id, e);
                    }
                    break;
                }
                _ = poll.tick() => match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("{}: process exited with {}", self.core.identity().id, status);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("{}: lost track of process: {}", self.core.identity().id, e);
                        break;
                    }
                },
            }
        }
        self.finish(generation);
    }

    fn finish(&self, generation: u64) {
        let Ok(mut slot) = self.running.lock() else {
            return;
        };
        if slot.as_ref().map(|run| run.generation) == Some(generation) {
            *slot = None;
            if let Err(e) = self.core.update(STATE, OFF) {
                warn!("{}: could not report process end: {}", self.core.identity().id, e);
            }
        }
    }
}

pub struct SubprocessCall {
    core: Arc<DeviceCore>,
    channels: Vec<Channel>,
    state: Arc<ProcessState>,
}

impl SubprocessCall {
    pub fn is_running(&self) -> bool {
        self.state
            .running
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Program and arguments started on `ON`.
    pub fn call(&self) -> (&str, &[String]) {
        (&self.state.program, &self.state.arguments)
    }
}

impl RemoteDevice for SubprocessCall {
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

impl DeviceKind for SubprocessCall {
    const CLASS_NAME: &'static str = "SubprocessCall";

    fn schema() -> DeviceClassSchema {
        DeviceClassSchema::base()
            .with("device_class", FieldType::String)
            .with("exec_path", FieldType::String)
            .with("arguments", FieldType::String)
            .with("looptime", FieldType::Integer)
    }

    fn build(ctx: &DeviceContext<'_>) -> Result<Self, DeviceError> {
        let runtime = Handle::try_current().map_err(|_| {
            DeviceError::MissingCapability("subprocess watcher needs a tokio runtime".to_string())
        })?;
        let public_class = ctx.config.str_field("device_class")?;
        let program = ctx.config.str_field("exec_path")?.to_string();
        let arguments = ctx
            .config
            .str_field("arguments")?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let looptime = ctx.config.int_field("looptime")?;
        let looptime = u64::try_from(looptime)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| DeviceError::InvalidField {
                field: "looptime".to_string(),
                reason: format!("{} is not a positive number of seconds", looptime),
            })?;

        let core = DeviceCore::builder(ctx, Self::CLASS_NAME, public_class).build();
        core.log_remote(
            Level::DEBUG,
            &format!("device created, call is {} {:?}", program, arguments),
        );

        let state = Arc::new(ProcessState {
            core: core.clone(),
            program,
            arguments,
            looptime,
            runtime,
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
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
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::devices::tests::context;
    use crate::mqtt::publisher::RecordingPublisher;
    use crate::persistence::tests::sample_settings;
    use crate::persistence::DeviceConfig;

    const STATE_TOPIC: &str = "device2mqtt/TestNode/SubprocessCall_Job/state";

    fn build(exec: &str, arguments: &str, publisher: Arc<RecordingPublisher>) -> SubprocessCall {
        let settings = sample_settings();
        let config = DeviceConfig::new()
            .with("name", "Job")
            .with("device_class", "switch")
            .with("exec_path", exec)
            .with("arguments", arguments)
            .with("looptime", 1);
        SubprocessCall::build(&context("Job", &config, &settings, publisher)).unwrap()
    }

    async fn wait_for_states(publisher: &RecordingPublisher, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let states = publisher.messages_on(STATE_TOPIC);
            if states.len() >= count {
                return states.into_iter().map(|m| m.payload).collect();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no state change after 5s");
    }

    #[tokio::test]
    async fn test_second_on_is_rejected() {
        let publisher = Arc::new(RecordingPublisher::default());
        let device = build("sleep", "5", publisher.clone());
        assert_eq!(device.call(), ("sleep", &["5".to_string()][..]));
        let command = device.channels()[1].handler().unwrap().clone();

        command("ON").unwrap();
        assert!(device.is_running());
        assert!(matches!(command("ON"), Err(DeviceError::Busy(_))));
        assert!(device.is_running());
        assert_eq!(publisher.messages_on(STATE_TOPIC).len(), 1);

        command("OFF").unwrap();
        let states = wait_for_states(&publisher, 2).await;
        assert_eq!(states, vec!["ON", "OFF"]);
        assert!(!device.is_running());
    }

    #[tokio::test]
    async fn test_off_while_idle_only_logs() {
        let publisher = Arc::new(RecordingPublisher::default());
        let device = build("sleep", "5", publisher.clone());

        device.channels()[1].handler().unwrap()("OFF").unwrap();
        assert!(!device.is_running());
        assert!(publisher.messages_on(STATE_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_exit() {
        let publisher = Arc::new(RecordingPublisher::default());
        let device = build("true", "", publisher.clone());
        let command = device.channels()[1].handler().unwrap().clone();

        command("ON").unwrap();
        let states = wait_for_states(&publisher, 2).await;
        assert_eq!(states, vec!["ON", "OFF"]);
        assert!(!device.is_running());

        command("ON").unwrap();
        assert_eq!(wait_for_states(&publisher, 4).await.len(), 4);
    }

    #[test]
    fn test_needs_runtime() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = DeviceConfig::new()
            .with("name", "Job")
            .with("device_class", "switch")
            .with("exec_path", "true")
            .with("arguments", "")
            .with("looptime", 1);
        let result = SubprocessCall::build(&context("Job", &config, &settings, publisher));
        assert!(matches!(result, Err(DeviceError::MissingCapability(_))));
    }

    #[tokio::test]
    async fn test_rejects_zero_looptime() {
        let settings = sample_settings();
        let publisher = Arc::new(RecordingPublisher::default());
        let config = DeviceConfig::new()
            .with("name", "Job")
            .with("device_class", "switch")
            .with("exec_path", "true")
            .with("arguments", "")
            .with("looptime", 0);
        let result = SubprocessCall::build(&context("Job", &config, &settings, publisher));
        assert!(matches!(result, Err(DeviceError::InvalidField { .. })));
    }
}
