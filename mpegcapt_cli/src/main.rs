use std::error::Error;
use std::fs::{self, OpenOptions};
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{error, info, LevelFilter};
use mpegcapt::firmware::{extract_image, find_images};
use mpegcapt::{CancelHandle, EncoderSettings, InputSource, Mpegcapt, SampleRate};
use simple_error::SimpleError;

/// Capture MPEG-2 from a CX23416 USB encoder box.
#[derive(Debug, Parser)]
#[command(name = "mpegcapt", version)]
struct Cli {
    /// More log output; repeat for frame traces.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the device up and record its stream.
    Capture(CaptureArgs),
    /// Cut the encoder firmware out of the vendor Windows driver.
    ExtractFirmware(ExtractArgs),
}

#[derive(Debug, Args)]
struct CaptureArgs {
    /// Use the S-Video input instead of composite.
    #[arg(short, long)]
    svideo: bool,

    /// Audio sample rate in Hz (32000, 44100 or 48000).
    #[arg(long, default_value_t = 32000)]
    sample_rate: u32,

    /// Average video bitrate in bit/s.
    #[arg(long, default_value_t = 6_000_000)]
    bitrate: u32,

    /// Peak video bitrate in bit/s.
    #[arg(long, default_value_t = 8_000_000)]
    peak_bitrate: u32,

    /// CX23416 firmware image.
    firmware: PathBuf,

    /// Where the MPEG stream is written.
    output: PathBuf,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// Vendor driver binary (p2usbwdm.sys).
    driver: PathBuf,

    /// Where the firmware image is written.
    output: PathBuf,

    /// Which image to take when the driver carries several.
    #[arg(long, default_value_t = 0)]
    index: usize,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn capture(args: CaptureArgs) -> Result<(), Box<dyn Error>> {
    let settings = EncoderSettings {
        bitrate: args.bitrate,
        peak_bitrate: args.peak_bitrate,
        sample_rate: SampleRate::try_from(args.sample_rate)?,
        ..Default::default()
    };
    let input = if args.svideo {
        InputSource::SVideo
    } else {
        InputSource::Composite
    };

    let firmware = fs::File::open(&args.firmware).map_err(|err| {
        SimpleError::new(format!(
            "couldn't open {} for reading: {}",
            args.firmware.display(),
            err
        ))
    })?;

    let mut session = Mpegcapt::connect()?.ok_or_else(|| SimpleError::new("device not found"))?;

    let device_info = session.bring_up(BufReader::new(firmware), &settings, input)?;
    info!("{:?}", device_info);

    let sink = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .map_err(|err| {
            SimpleError::new(format!("couldn't open {}: {}", args.output.display(), err))
        })?;

    let cancel = CancelHandle::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || handler_cancel.cancel())?;

    session.capture(sink, &cancel)?;
    Ok(())
}

fn extract_firmware(args: ExtractArgs) -> Result<(), Box<dyn Error>> {
    let driver = fs::read(&args.driver).map_err(|err| {
        SimpleError::new(format!("couldn't read {}: {}", args.driver.display(), err))
    })?;

    let images = find_images(&driver);
    for offset in &images {
        info!("firmware image at {:#x}", offset);
    }
    let offset = *images.get(args.index).ok_or_else(|| {
        SimpleError::new(format!(
            "{} has {} firmware images, no image {}",
            args.driver.display(),
            images.len(),
            args.index
        ))
    })?;

    fs::write(&args.output, extract_image(&driver, offset)?).map_err(|err| {
        SimpleError::new(format!("couldn't write {}: {}", args.output.display(), err))
    })?;
    info!("wrote {}", args.output.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Capture(args) => capture(args),
        Command::ExtractFirmware(args) => extract_firmware(args),
    };
    if let Err(err) = result {
        error!("{}", err);
        std::process::exit(1);
    }
}
