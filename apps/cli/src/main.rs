use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drive64_core::transport::list_devices;
use drive64_core::{
    Bank, Cic, Direction, DriveConfig, DriveEvent, DriveObserver, DriveSession, KNOWN_DEVICES,
    NusbTransport, Region, TracingObserver, stream_remaining,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "64drive USB cartridge tool (Pure Rust)", long_about = None)]
struct Args {
    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors; no progress
    #[arg(short, long, global = true)]
    quiet: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show hardware revision and firmware variant
    Info,
    /// List FTDI devices on the bus
    List,
    /// Upload FILE into a bank ("-" reads stdin)
    Load {
        file: String,
        #[command(flatten)]
        target: Target,
    },
    /// Dump a bank into FILE ("-" writes stdout)
    Dump {
        file: String,
        #[command(flatten)]
        target: Target,
    },
    /// Select the CIC mode (6101, 6102, 7101, 7102, 103, 105, 106, 5101)
    Cic {
        #[arg(value_parser = parse_cic)]
        cic: Cic,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Bank: rom, sram256, sram768, flash, pokemon, eeprom (or 1-6)
    #[arg(short, long)]
    bank: Option<Bank>,

    /// Byte offset inside the bank
    #[arg(short, long, default_value = "0", value_parser = parse_u32)]
    offset: u32,

    /// Bytes to transfer (default: whole input, or rest of the bank)
    #[arg(short, long, value_parser = parse_u64)]
    size: Option<u64>,
}

impl Target {
    fn region(&self, config: &DriveConfig) -> Region {
        Region::new(self.bank.unwrap_or(config.bank), self.offset)
    }
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let n = parse_u64(s)?;
    u32::try_from(n).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn parse_cic(s: &str) -> Result<Cic, String> {
    Cic::from_number(parse_u32(s)?).map_err(|e| e.to_string())
}

/// Draws a progress line on stderr; everything else goes to tracing.
struct ConsoleObserver {
    inner: TracingObserver,
}

impl DriveObserver for ConsoleObserver {
    fn on_event(&self, event: &DriveEvent) {
        if let DriveEvent::Progress {
            direction,
            current,
            total,
        } = event
        {
            let verb = match direction {
                Direction::Upload => "Uploading",
                Direction::Download => "Downloading",
            };
            let pct = if *total > 0 { current * 100 / total } else { 100 };
            eprint!("\r * {}... {:3}%", verb, pct);
            if current >= total {
                eprintln!();
            }
            return;
        }
        self.inner.on_event(event);
    }
}

fn open(config: DriveConfig) -> Result<DriveSession<NusbTransport, ConsoleObserver>> {
    let observer = Arc::new(ConsoleObserver {
        inner: TracingObserver,
    });
    Ok(DriveSession::open_with_observer(config, observer)?)
}

fn info_cmd(config: DriveConfig) -> Result<()> {
    let mut session = open(config)?;
    let id = session.get_version()?;
    println!("{} rev {} (0x{:08X})", session.version(), session.variant(), id);
    session.close();
    Ok(())
}

fn list_cmd() -> Result<()> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("No FTDI devices found");
        return Ok(());
    }
    for (i, dev) in devices.iter().enumerate() {
        let known = KNOWN_DEVICES
            .iter()
            .find(|k| k.vendor_id == dev.vendor_id && k.product_id == dev.product_id)
            .map(|k| format!(" [{}]", k.version))
            .unwrap_or_default();
        println!(
            "{}: {:04x}:{:04x} {} / {} / {}{}",
            i,
            dev.vendor_id,
            dev.product_id,
            dev.manufacturer.as_deref().unwrap_or("?"),
            dev.product.as_deref().unwrap_or("?"),
            dev.serial.as_deref().unwrap_or("?"),
            known
        );
    }
    Ok(())
}

fn load_cmd(mut config: DriveConfig, file: &str, target: &Target) -> Result<()> {
    let region = target.region(&config);
    let (mut source, length): (Box<dyn Read>, u64) = if file == "-" {
        config.progress = false;
        match target.size {
            Some(size) => (Box::new(io::stdin().lock()), size),
            None => {
                let mut data = Vec::new();
                io::stdin()
                    .read_to_end(&mut data)
                    .context("reading stdin")?;
                let len = data.len() as u64;
                (Box::new(Cursor::new(data)), len)
            }
        }
    } else {
        let mut f = File::open(file).with_context(|| format!("opening {}", file))?;
        let len = match target.size {
            Some(size) => size,
            None => stream_remaining(&mut f).with_context(|| format!("sizing {}", file))?,
        };
        (Box::new(BufReader::new(f)), len)
    };

    let mut session = open(config)?;
    info!(file, bank = %region.bank, offset = region.offset, length, "Uploading");
    let report = session.upload(region, length, &mut source)?;
    session.close();
    info!(bytes = report.bytes, chunks = report.chunks, "Upload complete");
    Ok(())
}

fn dump_cmd(mut config: DriveConfig, file: &str, target: &Target) -> Result<()> {
    let region = target.region(&config);
    let mut sink: Box<dyn Write> = if file == "-" {
        config.progress = false;
        Box::new(io::stdout().lock())
    } else {
        let f = File::create(file).with_context(|| format!("creating {}", file))?;
        Box::new(BufWriter::new(f))
    };

    let mut session = open(config)?;
    info!(file, bank = %region.bank, offset = region.offset, "Downloading");
    let report = session.download(region, target.size, &mut sink)?;
    session.close();
    info!(bytes = report.bytes, chunks = report.chunks, "Download complete");
    Ok(())
}

fn cic_cmd(config: DriveConfig, cic: Cic) -> Result<()> {
    let mut session = open(config)?;
    session.set_cic(cic)?;
    session.close();
    println!("CIC set to {}", cic);
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => DriveConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DriveConfig::default(),
    };
    if args.quiet {
        config.progress = false;
    }

    match &args.command {
        Cmd::Info => info_cmd(config),
        Cmd::List => list_cmd(),
        Cmd::Load { file, target } => load_cmd(config, file, target),
        Cmd::Dump { file, target } => dump_cmd(config, file, target),
        Cmd::Cic { cic } => cic_cmd(config, *cic),
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
