//! Command-line front end for programming STM32 parts over DfuSe.
//!
//! Every device command opens the first bootloader matching `--vid`/`--pid`,
//! runs one job on the DFU engine and prints its status events as they
//! arrive.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;

use stm32_dfu_programmer::dfu::config::DEVICE_SCAN_INTERVAL;
use stm32_dfu_programmer::dfu::{
    find_dfu_devices, read_dfu_file, wait_for_dfu_device, DfuEngine, DfuError, DfuEvent,
    DfuResult, JobReceiver, OptionBytes, Outcome, RusbTransport,
};
use stm32_dfu_programmer::settings::{ProgrammerSettings, SettingsManager};

/// Program STM32 devices through the DfuSe ROM bootloader.
///
/// Put the part into its bootloader (BOOT0 high, then reset) before running
/// any device command.
#[derive(Debug, Parser)]
#[command(name = "stm32-dfu", version)]
struct Cli {
    /// USB vendor ID of the bootloader [default: from settings]
    #[arg(long, global = true, value_parser = parse_u16)]
    vid: Option<u16>,

    /// USB product ID of the bootloader [default: from settings]
    #[arg(long, global = true, value_parser = parse_u16)]
    pid: Option<u16>,

    /// Directory holding programmer_settings.json
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached DFU bootloaders.
    List,
    /// Validate a .dfu file and print its contents.
    Info { file: PathBuf },
    /// Full programming run: erase, write, verify, then option bytes.
    Flash { file: PathBuf },
    /// Write a .dfu file without erasing or verifying.
    Write { file: PathBuf },
    /// Compare device flash with a .dfu file.
    Verify { file: PathBuf },
    /// Mass erase. With a file, a device that is already blank is left alone.
    Erase { file: Option<PathBuf> },
    /// Enable x32 parallelism in the bootloader feature register.
    FastOps,
    /// Leave DFU mode and start the application.
    Leave,
    /// Write the user option byte word (e.g. 0xAAE8).
    OptionBytes {
        #[arg(value_parser = parse_u16)]
        value: u16,
    },
}

fn parse_u16(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid value '{}': {}", value, e))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Event printer. Progress events are thinned to one line per 10%.
struct Printer {
    json: bool,
    last_decile: AtomicU32,
}

impl Printer {
    fn print(&self, event: &DfuEvent) {
        let now = Local::now();

        if self.json {
            let line = json!({
                "time": now.to_rfc3339(),
                "percent": event.percent(),
                "message": event.message(),
                "event": event,
            });
            println!("{}", line);
            return;
        }

        match event {
            // Reported by main with the exit status
            DfuEvent::Failed { .. } => return,
            DfuEvent::Writing { .. } | DfuEvent::Verifying { .. } => {
                let decile = event.percent() as u32 / 10;
                if self.last_decile.swap(decile, Ordering::Relaxed) == decile {
                    return;
                }
            }
            _ => {}
        }
        println!("[{}] {}", now.format("%H:%M:%S%.3f"), event.message());
    }
}

async fn finish<R>(job: JobReceiver<R>) -> DfuResult<R> {
    job.await.unwrap_or_else(|_| Err(DfuError::WorkerStopped))
}

fn load_settings(cli: &Cli) -> DfuResult<ProgrammerSettings> {
    let dir = cli.settings.clone().unwrap_or_else(|| PathBuf::from("."));
    let manager = SettingsManager::new(&dir);
    let mut settings = manager.load()?;
    log::debug!("Settings from {}", manager.settings_path().display());

    if let Some(vid) = cli.vid {
        settings.vendor_id = vid;
    }
    if let Some(pid) = cli.pid {
        settings.product_id = pid;
    }
    if settings.has_non_default_settings() {
        log::info!("Using non-default settings: {:?}", settings);
    }
    Ok(settings)
}

fn connect(engine: &DfuEngine, settings: &ProgrammerSettings) -> DfuResult<()> {
    let devices = find_dfu_devices(settings.vendor_id, settings.product_id);
    let Some(device) = devices.first() else {
        return Err(DfuError::NotConnected);
    };
    if devices.len() > 1 {
        log::warn!("{} bootloaders attached, using the first", devices.len());
    }
    log::info!("Opening {}", device.display_label());

    let transport = RusbTransport::open(settings.vendor_id, settings.product_id)?;
    engine.set_transport(Some(Box::new(transport)));
    Ok(())
}

fn reconnect(engine: &DfuEngine, settings: &ProgrammerSettings) -> DfuResult<()> {
    // Let the old enumeration disappear first
    std::thread::sleep(DEVICE_SCAN_INTERVAL);
    wait_for_dfu_device(
        settings.vendor_id,
        settings.product_id,
        None,
        settings.reenumerate_timeout_ms,
    )?;
    connect(engine, settings)
}

fn list(settings: &ProgrammerSettings, json: bool) -> DfuResult<bool> {
    let devices = find_dfu_devices(settings.vendor_id, settings.product_id);
    if json {
        println!("{}", serde_json::to_string(&devices)?);
    } else if devices.is_empty() {
        println!("No DFU devices found");
    } else {
        for device in &devices {
            let serial = device.serial_number.as_deref().unwrap_or("-");
            println!("{}  serial {}", device.display_label(), serial);
        }
    }
    Ok(!devices.is_empty())
}

fn info(file: &Path, json: bool) -> DfuResult<bool> {
    let image = read_dfu_file(file)?;
    if json {
        let summary = json!({
            "targetName": image.target_name,
            "alternateSetting": image.alternate_setting,
            "address": image.element_address,
            "length": image.element_length,
            "vendorId": image.vendor_id,
            "productId": image.product_id,
            "bootloaderVersion": image.bootloader_version,
            "crc": image.file_crc,
            "fileSize": image.file_size,
            "sha256": image.sha256_hex(),
        });
        println!("{}", summary);
    } else {
        println!("Target:     {} (alt {})", image.target_name, image.alternate_setting);
        println!(
            "Element:    {} bytes at 0x{:08X}..0x{:08X}",
            image.element_length,
            image.element_address,
            image.end_address()
        );
        println!(
            "Device:     {:04X}:{:04X}, bootloader 0x{:04X}",
            image.vendor_id, image.product_id, image.bootloader_version
        );
        println!("File:       {} bytes, CRC 0x{:08X}", image.file_size, image.file_crc);
        println!("SHA-256:    {}", image.sha256_hex());
    }
    Ok(true)
}

async fn run(cli: Cli) -> DfuResult<bool> {
    let settings = load_settings(&cli)?;

    match &cli.command {
        Command::List => return list(&settings, cli.json),
        Command::Info { file } => return info(file, cli.json),
        _ => {}
    }

    let printer = Printer {
        json: cli.json,
        last_decile: AtomicU32::new(u32::MAX),
    };
    let mut engine = DfuEngine::new(settings.clone(), move |event| printer.print(&event))?;
    connect(&engine, &settings)?;

    let success = match cli.command {
        Command::List | Command::Info { .. } => true,
        Command::Flash { file } => {
            let mut outcome = finish(engine.program_firmware(file.clone())).await?;
            if outcome == Outcome::DeviceResetting {
                reconnect(&engine, &settings)?;
                outcome = finish(engine.program_firmware(file)).await?;
            }
            outcome == Outcome::Complete
        }
        Command::Write { file } => {
            finish(engine.load_file(file)).await?;
            finish(engine.program()).await?;
            true
        }
        Command::Verify { file } => {
            finish(engine.load_file(file)).await?;
            finish(engine.verify()).await?
        }
        Command::Erase { file } => {
            if let Some(file) = file {
                finish(engine.load_file(file)).await?;
            }
            let outcome = finish(engine.mass_erase()).await?;
            if outcome == Outcome::DeviceResetting {
                // Protection removal already erased the part
                reconnect(&engine, &settings)?;
            }
            true
        }
        Command::FastOps => {
            finish(engine.fast_operations()).await?;
            true
        }
        Command::Leave => finish(engine.leave_dfu_mode()).await?,
        Command::OptionBytes { value } => {
            finish(engine.write_option_bytes(OptionBytes::from_bits(value))).await?;
            true
        }
    };

    if !engine.shutdown() {
        log::warn!("DFU worker still busy at exit");
    }
    Ok(success)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error [{}]: {}", e.error_code(), e);
            ExitCode::FAILURE
        }
    }
}
