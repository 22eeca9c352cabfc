use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dfu_core::events::{DfuEvent, DfuObserver};
use dfu_core::transport::MockBehavior;
use dfu_core::{
    DfuState, FirmwareImage, MockTransport, SessionConfig, SessionController, SharedTransport,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE Device Firmware Update tool", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a firmware package and list its parts
    Inspect {
        /// DFU zip package or raw .bin application
        firmware: PathBuf,
    },
    /// Run a complete update against a simulated device
    Simulate {
        firmware: PathBuf,

        /// ATT MTU of the simulated link
        #[arg(long, default_value_t = 23)]
        mtu: usize,

        /// Packet receipt interval (overrides the config file)
        #[arg(long)]
        prn: Option<u16>,

        /// Pause once at this percent of the first part, then resume
        #[arg(long)]
        pause_at: Option<u8>,

        /// Device never acknowledges the mode switch
        #[arg(long)]
        drop_mode_acks: bool,

        /// Device reports wrong checksums
        #[arg(long)]
        corrupt_crc: bool,
    },
    /// Manage session configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Scan for DFU-capable peripherals
    #[cfg(feature = "ble")]
    Scan {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Update a real peripheral over Bluetooth LE
    #[cfg(feature = "ble")]
    Flash {
        firmware: PathBuf,

        /// Peripheral identifier as printed by `scan`
        #[arg(long)]
        id: String,

        /// ATT MTU negotiated by the platform
        #[arg(long)]
        mtu: Option<usize>,

        #[arg(long, default_value_t = 5)]
        scan_seconds: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the effective configuration to a file
    Init {
        #[arg(default_value = "dfu.toml")]
        path: PathBuf,
    },
    /// Print the effective configuration
    Show,
}

/// Prints states and progress on the terminal.
struct ConsoleObserver;

impl DfuObserver for ConsoleObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged { description, .. } => println!("{description}"),
            DfuEvent::Progress(sample) => println!("{:>3}% {}", sample.percent, sample),
            DfuEvent::Error { code, message } => eprintln!("DFU error ({code}): {message}"),
            DfuEvent::Completed => println!("Done"),
            DfuEvent::Log { .. } | DfuEvent::Packet { .. } => {}
        }
    }
}

/// Pauses once the first part reaches a given percent, then resumes.
struct PauseOnce {
    controller: SessionController,
    percent: u8,
    fired: AtomicBool,
}

impl DfuObserver for PauseOnce {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Progress(s)
                if s.part == 1
                    && s.percent >= self.percent
                    && !self.fired.swap(true, Ordering::SeqCst) =>
            {
                self.controller.pause();
            }
            DfuEvent::StateChanged {
                to: DfuState::Paused,
                ..
            } => {
                info!("Resuming after pause");
                self.controller.resume();
            }
            _ => {}
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match args.command {
        Command::Inspect { firmware } => inspect(&firmware),
        Command::Simulate {
            firmware,
            mtu,
            prn,
            pause_at,
            drop_mode_acks,
            corrupt_crc,
        } => {
            let mut config = config;
            if let Some(prn) = prn {
                config.packet_receipt_interval = prn;
            }
            let behavior = MockBehavior {
                drop_mode_acks,
                corrupt_checksum: corrupt_crc,
                mtu,
                ..MockBehavior::default()
            };
            simulate(&firmware, config, behavior, pause_at)
        }
        Command::Config {
            action: ConfigAction::Init { path },
        } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
            Ok(())
        }
        Command::Config {
            action: ConfigAction::Show,
        } => {
            println!("{config:#?}");
            Ok(())
        }
        #[cfg(feature = "ble")]
        Command::Scan { seconds } => {
            let found = dfu_core::transport::scan(std::time::Duration::from_secs(seconds))?;
            if found.is_empty() {
                println!("No DFU peripherals found");
            }
            for (i, peripheral) in found.iter().enumerate() {
                println!("{i:>2}: {peripheral}");
            }
            Ok(())
        }
        #[cfg(feature = "ble")]
        Command::Flash {
            firmware,
            id,
            mtu,
            scan_seconds,
        } => flash(&firmware, config, &id, mtu, scan_seconds),
    }
}

fn load(firmware: &Path) -> Result<FirmwareImage> {
    FirmwareImage::load(firmware).with_context(|| format!("loading {}", firmware.display()))
}

fn inspect(firmware: &Path) -> Result<()> {
    let image = load(firmware)?;

    println!("{}: {} part(s), {} bytes", image.id(), image.part_count(), image.total_size());
    for (i, part) in image.parts().iter().enumerate() {
        println!(
            "  {}. {:<22} {:>8} bytes  CRC32 {:08X}  init packet: {}",
            i + 1,
            part.kind().to_string(),
            part.len(),
            part.crc(),
            part.init_packet()
                .map_or_else(|| "none".to_string(), |p| format!("{} bytes", p.len()))
        );
    }
    Ok(())
}

fn simulate(
    firmware: &Path,
    config: SessionConfig,
    behavior: MockBehavior,
    pause_at: Option<u8>,
) -> Result<()> {
    let image = load(firmware)?;
    let transport = SharedTransport::new(MockTransport::with_behavior(behavior));

    let controller = SessionController::new(config);
    controller.register(Arc::new(ConsoleObserver));
    if let Some(percent) = pause_at {
        controller.register(Arc::new(PauseOnce {
            controller: controller.clone(),
            percent,
            fired: AtomicBool::new(false),
        }));
    }

    controller.start(&transport, image)?;
    controller.wait()?;

    let received = transport.inner().received_parts();
    info!(
        parts = received.len(),
        bytes = received.iter().map(Vec::len).sum::<usize>(),
        "Simulated device received firmware"
    );
    Ok(())
}

#[cfg(feature = "ble")]
fn flash(
    firmware: &Path,
    config: SessionConfig,
    id: &str,
    mtu: Option<usize>,
    scan_seconds: u64,
) -> Result<()> {
    use std::time::Duration;

    use dfu_core::{BleTransport, DfuVariant, PeripheralRef};

    let image = load(firmware)?;

    let found = dfu_core::transport::scan(Duration::from_secs(scan_seconds))?;
    let target = found
        .find(id)
        .cloned()
        .unwrap_or_else(|| PeripheralRef::new(id, DfuVariant::Legacy));
    info!(peripheral = %target, "Selected peripheral");
    if target.variant == DfuVariant::Secure {
        warn!("Secure DFU targets are driven with the legacy command set");
    }

    let transport = SharedTransport::new(
        BleTransport::open(&target, mtu, Duration::from_secs(scan_seconds))?
            .with_write_timeout(config.response_timeout()),
    );

    let controller = SessionController::new(config);
    controller.register(Arc::new(ConsoleObserver));
    controller.start(&transport, image)?;
    controller.wait()?;
    Ok(())
}
