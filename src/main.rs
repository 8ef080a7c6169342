use color_eyre::{eyre::eyre, Result};
use device2mqtt::devices::DeviceClasses;
use device2mqtt::mqtt::bridge::{Bridge, BridgeHandle, Disconnected};
use device2mqtt::mqtt::config::MqttConfig;
use device2mqtt::mqtt::publisher::OutboxPublisher;
use device2mqtt::mqtt::transport::MqttTransport;
use device2mqtt::persistence::config_merge::MergeRequest;
use device2mqtt::persistence::{default_config_path, PersistedConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const USAGE: &str =
    "usage: device2mqtt [CONFIG] [run|announce|retract|add <DEVICES.toml> [--force]]";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Connect, announce and dispatch until Ctrl-C
    Run,
    /// Publish retained discovery documents and exit
    Announce,
    /// Remove every device from the broker side and exit
    Retract,
    /// Merge the devices of a file into the configuration
    Add { devices: PathBuf, force: bool },
}

impl Command {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "run" => Some(Command::Run),
            "announce" => Some(Command::Announce),
            "retract" => Some(Command::Retract),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
struct Args {
    config_path: PathBuf,
    command: Command,
}

fn set_command(slot: &mut Option<Command>, command: Command) -> Result<()> {
    if slot.replace(command).is_some() {
        return Err(eyre!("more than one command given\n{}", USAGE));
    }
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut config_path = None;
    let mut command = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Err(eyre!(USAGE)),
            "add" => {
                let devices = args
                    .next()
                    .filter(|next| !next.starts_with('-'))
                    .ok_or_else(|| eyre!("add needs a device file\n{}", USAGE))?;
                set_command(
                    &mut command,
                    Command::Add {
                        devices: PathBuf::from(devices),
                        force: false,
                    },
                )?;
            }
            "--force" => match command.as_mut() {
                Some(Command::Add { force, .. }) => *force = true,
                _ => return Err(eyre!("--force only applies to add\n{}", USAGE)),
            },
            _ => {
                if let Some(parsed) = Command::parse(&arg) {
                    set_command(&mut command, parsed)?;
                } else if command.is_none() && config_path.is_none() {
                    config_path = Some(PathBuf::from(arg));
                } else {
                    return Err(eyre!("unexpected argument '{}'\n{}", arg, USAGE));
                }
            }
        }
    }

    Ok(Args {
        config_path: config_path.unwrap_or_else(default_config_path),
        command: command.unwrap_or(Command::Run),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let args = parse_args(std::env::args().skip(1))?;
    if let Command::Add { devices, force } = &args.command {
        return add(&args.config_path, devices, *force).await;
    }

    info!("Loading configuration from {}", args.config_path.display());
    let config = PersistedConfig::load(&args.config_path).await?;

    let (publisher, outbox) = OutboxPublisher::channel();
    let transport = MqttTransport::new(MqttConfig::from_settings(&config.bridge_settings), outbox);
    let bridge = Bridge::create(
        &config,
        &DeviceClasses::default(),
        Arc::new(publisher),
        Box::new(transport),
    )?;

    match args.command {
        Command::Run => run(bridge).await,
        command => publish_once(bridge, command).await,
    }
}

async fn add(config_path: &Path, devices: &Path, force: bool) -> Result<()> {
    info!(
        "Merging {} into {}{}",
        devices.display(),
        config_path.display(),
        if force { " (forced)" } else { "" }
    );
    let request = MergeRequest::load(devices).await?;
    let report = request
        .apply(config_path, force, &DeviceClasses::default())
        .await?;

    for (device_class, object_id) in &report.added {
        info!("Added {}/{}", device_class, object_id);
    }
    for (device_class, object_id) in &report.replaced {
        info!("Replaced {}/{}", device_class, object_id);
    }
    if report.is_empty() {
        warn!("{} names no devices", devices.display());
    }
    Ok(())
}

async fn run(bridge: Bridge<Disconnected>) -> Result<()> {
    let subscribed = bridge.connect()?.subscribe()?;
    subscribed.announce_all(false);
    let mut handle = BridgeHandle::spawn(subscribed.start());

    let stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received, stopping bridge");
            handle.shutdown().await?
        }
        stopped = handle.join() => {
            warn!("Bridge stopped on its own");
            stopped?
        }
    };

    stopped.flush(FLUSH_TIMEOUT).await;
    stopped.close().await;
    Ok(())
}

async fn publish_once(bridge: Bridge<Disconnected>, command: Command) -> Result<()> {
    let connected = bridge.connect()?;
    let published = match command {
        Command::Retract => connected.retract_all(),
        _ => connected.announce_all(true),
    };
    info!("{:?}: {} discovery messages queued", command, published);

    if !connected.flush(FLUSH_TIMEOUT).await {
        warn!("Not every discovery message could be handed to the broker");
    }
    connected.disconnect().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.command, Command::Run);
        assert_eq!(parsed.config_path, default_config_path());

        let parsed = args(&["/etc/bridge.toml", "retract"]).unwrap();
        assert_eq!(parsed.config_path, PathBuf::from("/etc/bridge.toml"));
        assert_eq!(parsed.command, Command::Retract);

        let parsed = args(&["announce"]).unwrap();
        assert_eq!(parsed.command, Command::Announce);

        assert!(args(&["run", "bridge.toml"]).is_err());
        assert!(args(&["a.toml", "b.toml"]).is_err());
        assert!(args(&["run", "announce"]).is_err());
        assert!(args(&["--help"]).is_err());
    }

    #[test]
    fn test_parse_add() {
        let parsed = args(&["/etc/bridge.toml", "add", "new.toml"]).unwrap();
        assert_eq!(parsed.config_path, PathBuf::from("/etc/bridge.toml"));
        assert_eq!(
            parsed.command,
            Command::Add {
                devices: PathBuf::from("new.toml"),
                force: false
            }
        );

        let parsed = args(&["add", "new.toml", "--force"]).unwrap();
        assert_eq!(parsed.config_path, default_config_path());
        assert_eq!(
            parsed.command,
            Command::Add {
                devices: PathBuf::from("new.toml"),
                force: true
            }
        );

        assert!(args(&["add"]).is_err());
        assert!(args(&["add", "--force"]).is_err());
        assert!(args(&["run", "--force"]).is_err());
        assert!(args(&["add", "a.toml", "retract"]).is_err());
    }
}
