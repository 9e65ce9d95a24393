mod dfu;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info, LevelFilter};

use dfu::ble::AddressType;
use dfu::config::{DEFAULT_BLE_INTERFACE, DEFAULT_SERIAL_PORT};
use dfu::{
    BleOptions, BleTransport, DfuEngine, DfuPackage, DfuProgress, DfuResult, DfuTransport,
    EngineOptions, SerialTransport,
};

/// Firmware upgrade tool for Nordic Secure DFU bootloaders.
#[derive(Parser, Debug)]
#[command(name = "nrfdfu", version)]
struct Cli {
    /// Serial device of the DFU target.
    #[arg(short, long, default_value = DEFAULT_SERIAL_PORT, conflicts_with = "ble")]
    port: String,

    /// BLE address of the DFU target, instead of a serial port.
    #[arg(short = 'b', long = "ble", value_name = "ADDRESS")]
    ble: Option<String>,

    /// BLE address type.
    #[arg(short = 't', long = "atype", value_enum, default_value = "random")]
    atype: AddressType,

    /// BLE host interface.
    #[arg(short, long, default_value = DEFAULT_BLE_INTERFACE)]
    interface: String,

    /// Packet receipt notification interval (0 disables).
    #[arg(long, default_value_t = 0)]
    prn: u16,

    /// Verbosity level, 1..4.
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "1"
    )]
    debug: Option<u8>,

    /// Firmware package (ZIP archive with manifest, init packet and image).
    zipfile: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.debug);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("upgrade failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logger(debug: Option<u8>) {
    let level = match debug.unwrap_or(0) {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> DfuResult<()> {
    debug!("package: {}", cli.zipfile.display());
    let package = DfuPackage::open(&cli.zipfile)?;
    info!(
        "init packet {} bytes, firmware {} bytes",
        package.init_data.len(),
        package.firmware_data.len()
    );

    match &cli.ble {
        Some(address) => {
            let transport = BleTransport::connect(&BleOptions {
                address: address.clone(),
                address_type: cli.atype,
                adapter: cli.interface.clone(),
            })?;
            upgrade(transport, &package, cli.prn)
        }
        None => {
            debug!("port: {}", cli.port);
            let transport = SerialTransport::open(&cli.port)?;
            upgrade(transport, &package, cli.prn)
        }
    }
}

fn upgrade<T: DfuTransport>(transport: T, package: &DfuPackage, prn: u16) -> DfuResult<()> {
    let options = EngineOptions {
        prn,
        ..EngineOptions::default()
    };
    let mut engine = DfuEngine::new(transport, options, |progress| match progress {
        DfuProgress::Uploading { .. } => {
            debug!("[{:3.0}%] {}", progress.percent(), progress.message())
        }
        _ => info!("[{:3.0}%] {}", progress.percent(), progress.message()),
    });
    engine.run(&package.init_data, &package.firmware_data)
}
