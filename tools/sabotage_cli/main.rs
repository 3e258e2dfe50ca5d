// Command-line front end for the Sonic Sabotage library.

use clap::{Parser, Subcommand};
use serde::Serialize;
use sonic_sabotage_lib::ble::{self, BtleplugLink};
use sonic_sabotage_lib::config::{self, SabotageConfig};
use sonic_sabotage_lib::download::{self, DownloadProgress};
use sonic_sabotage_lib::handoff::HandoffController;
use sonic_sabotage_lib::transfer::FirmwareTransfer;
use sonic_sabotage_lib::wifi::{self, NmcliNetworks, WifiNetworks};
use sonic_sabotage_lib::{
    DeviceHandle, DeviceSession, FirmwareArtifact, FlashController, Setting, SharedSession,
};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "sabotage_cli", about = "Configure and flash Sonic Sabotage sensors")]
struct Args {
    /// Config file (defaults to the per-user config location).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan for sensors.
    Scan {
        #[arg(short, long, default_value_t = 10)]
        secs: u64,
    },
    /// Connect and print the current settings.
    Show { address: String },
    /// Write one setting (buzzer, mode, fixed-interval, random-interval, rssi-min, solar-min).
    Set {
        address: String,
        setting: Setting,
        value: u8,
    },
    /// Print length and SHA-256 of a firmware file.
    Hash { file: PathBuf },
    /// Download the published firmware.
    Download {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Push a firmware file to a sensor over its Wi-Fi access point.
    Flash {
        address: String,
        /// Local firmware file; downloads the published image when omitted.
        file: Option<PathBuf>,
    },
    /// Write the effective configuration to the config file.
    InitConfig,
}

fn print_event<T: Serialize + std::fmt::Debug>(json: bool, event: &T) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("failed to encode event: {e}"),
        }
    } else {
        println!("{event:?}");
    }
}

async fn open_session(address: &str, json: bool) -> Result<SharedSession, Box<dyn Error>> {
    let session = DeviceSession::new(Box::new(BtleplugLink::new()));
    let mut events = session.subscribe_events();
    let shared = session.into_shared();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(json, &event);
        }
    });
    shared
        .lock()
        .await
        .connect(DeviceHandle::new(address, address, None))
        .await?;
    Ok(shared)
}

async fn download_with_progress(
    config: &SabotageConfig,
) -> Result<FirmwareArtifact, Box<dyn Error>> {
    let (tx, mut rx) = watch::channel(DownloadProgress::default());
    let printer = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            if let DownloadProgress::Percent { percent } = *rx.borrow_and_update() {
                eprint!("\rdownloading... {percent:3}%");
            }
        }
        eprintln!();
    });
    let result = download::download_firmware(&config.download, &tx).await;
    drop(tx);
    let _ = printer.await;
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config_path = args.config.clone().or_else(config::config_path);
    let config = match &config_path {
        Some(path) if path.exists() => SabotageConfig::load(path)?,
        _ => SabotageConfig::default(),
    };
    sonic_sabotage_lib::init_logging(&config);

    match args.command {
        Command::Scan { secs } => {
            for device in ble::scan(Duration::from_secs(secs)).await? {
                println!(
                    "{}  {}  rssi={}",
                    device.address,
                    device.name,
                    device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "?".into())
                );
            }
        }

        Command::Show { address } => {
            let session = open_session(&address, args.json).await?;
            let mut session = session.lock().await;
            for setting in Setting::ALL {
                let slot = session.settings().get(setting);
                println!("{setting:>16}: {:?}", slot.confirmed);
            }
            if let Some(password) = session.wifi_password() {
                println!("{:>16}: {password}", "wifi-password");
            }
            session.disconnect().await?;
        }

        Command::Set {
            address,
            setting,
            value,
        } => {
            let session = open_session(&address, args.json).await?;
            let mut session = session.lock().await;
            if setting.is_schedule() {
                session.apply_schedule(setting, value).await?;
            } else {
                session.write_setting(setting, value).await?;
            }
            session.disconnect().await?;
        }

        Command::Hash { file } => {
            let artifact = FirmwareArtifact::from_path(&file).await?;
            println!("{}  {} bytes  {}", artifact.sha256, artifact.len, artifact.path.display());
        }

        Command::Download { dir } => {
            let mut config = config.clone();
            if let Some(dir) = dir {
                config.download.download_dir = dir;
            }
            let artifact = download_with_progress(&config).await?;
            println!("{}  {} bytes  {}", artifact.sha256, artifact.len, artifact.path.display());
        }

        Command::Flash { address, file } => {
            let artifact = match file {
                Some(file) => FirmwareArtifact::from_path(&file).await?,
                None => download_with_progress(&config).await?,
            };
            println!("{}  {} bytes", artifact.sha256, artifact.len);

            let session = open_session(&address, args.json).await?;
            let networks: Arc<dyn WifiNetworks> = Arc::new(NmcliNetworks);
            let (network_events, monitor) =
                wifi::spawn_network_monitor(networks.clone(), NETWORK_POLL_INTERVAL);
            let controller = FlashController::new(
                session.clone(),
                HandoffController::new(networks, config.handoff.clone()),
                FirmwareTransfer::new(config.transfer.clone()),
                network_events,
            );

            let mut events = controller.subscribe();
            let json = args.json;
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    print_event(json, &event);
                }
            });

            let result = controller.flash(&artifact).await;
            monitor.abort();
            if let Err(e) = session.lock().await.disconnect().await {
                eprintln!("disconnect failed: {e}");
            }
            result?;
        }

        Command::InitConfig => {
            let path = config_path.ok_or("no config directory on this platform")?;
            config.save(&path)?;
            println!("wrote {}", path.display());
        }
    }

    sonic_sabotage_lib::stop_file_logging();
    Ok(())
}
