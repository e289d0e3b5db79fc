use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use zephyr_core::bootloader::main_image_checksum;
use zephyr_core::protocol::constants::{DEFAULT_MIN_PRESSURE, MAX_FINGER_ORIENTATION};
use zephyr_core::{
    FingerRecord, FirmwareImages, FrameDecoder, FrameOutcome, RecordingSink, SessionConfig,
    SimulatedController, TouchEvent, ZephyrSession, chunk_plan,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Zephyr multitouch protocol tool", long_about = None)]
struct Args {
    /// Path to a TOML session configuration
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
    /// Bring up a simulated controller and replay synthetic touch frames
    Simulate {
        /// Number of touch frames to replay
        #[arg(long, default_value_t = 5)]
        frames: u8,

        /// Fingers per frame
        #[arg(long, default_value_t = 2)]
        fingers: u8,

        /// Corrupt this many device responses before the first frame
        #[arg(long, default_value_t = 0)]
        corrupt: usize,
    },
    /// Decode a hex-encoded frame payload
    Decode {
        /// Frame payload, header first
        payload: String,

        /// Sensor height used for the Y flip
        #[arg(long, default_value_t = 6300)]
        height: i32,

        /// Pressure floor
        #[arg(long, default_value_t = DEFAULT_MIN_PRESSURE)]
        min_pressure: u8,
    },
    /// Print the upload plan for a pair of firmware images
    Plan {
        /// First-stage image (defaults to the configured path)
        #[arg(long)]
        aspeed: Option<String>,

        /// Main firmware image (defaults to the configured path)
        #[arg(long)]
        main: Option<String>,
    },
    /// Write a default configuration file
    InitConfig {
        #[arg(default_value = "zephyr.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
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

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match args.command {
        Command::Simulate {
            frames,
            fingers,
            corrupt,
        } => simulate(config, frames, fingers, corrupt),
        Command::Decode {
            payload,
            height,
            min_pressure,
        } => decode(&payload, height, min_pressure),
        Command::Plan { aspeed, main } => plan(config, aspeed, main),
        Command::InitConfig { path, force } => init_config(&path, force),
    }
}

fn simulate(config: SessionConfig, frames: u8, fingers: u8, corrupt: usize) -> Result<()> {
    let images = match FirmwareImages::load(&config) {
        Ok(images) => images,
        Err(e) => {
            warn!(error = %e, "Using synthetic firmware images");
            synthetic_images()?
        }
    };

    let sim = Arc::new(SimulatedController::new());
    let sink = Arc::new(RecordingSink::new());
    let session = ZephyrSession::new(Arc::clone(&sim), Arc::clone(&sink), config);

    let device = session.setup(&images)?;
    println!(
        "Device up: family 0x{:02X}, {}x{} sensor, {}x{} surface, version {:04X}",
        device.family_id,
        device.sensor_columns,
        device.sensor_rows,
        device.sensor_width,
        device.sensor_height,
        device.bcd_version
    );

    sim.corrupt_next(corrupt);
    for n in 0..frames {
        let records: Vec<FingerRecord> = (0..fingers)
            .map(|id| synthetic_finger(id, n, device.sensor_width, device.sensor_height))
            .collect();
        sim.queue_touch_frame(n, u32::from(n) * 8_000, &records);

        match session.read_frame() {
            Ok(FrameOutcome::Decoded(summary)) => {
                println!("Frame {}: {} contact(s)", n, summary.contacts);
            }
            Ok(other) => println!("Frame {}: {:?}", n, other),
            Err(e) => println!("Frame {}: read failed: {}", n, e),
        }
        for event in sink.take_events() {
            print_event(&event);
        }
    }

    let stats = sim.stats();
    info!(
        frames = stats.frames_delivered,
        corrupted = stats.corrupted_responses,
        "Simulation finished"
    );
    session.detach();
    Ok(())
}

fn decode(payload: &str, height: i32, min_pressure: u8) -> Result<()> {
    let data = hex::decode(payload.replace([' ', ':'], "")).context("payload is not valid hex")?;
    let sink = RecordingSink::new();
    let summary = FrameDecoder::new(height)
        .with_min_pressure(min_pressure)
        .decode(&data, &sink);

    match summary.header {
        Some(header) => println!(
            "Frame type 0x{:02X} #{} at {}: {} finger(s), header {} bytes, stride {}",
            header.frame_type,
            header.frame_num,
            header.timestamp,
            header.num_fingers,
            header.header_len,
            header.finger_data_len
        ),
        None => println!("Frame header truncated ({} bytes)", data.len()),
    }
    for event in sink.events() {
        print_event(&event);
    }
    Ok(())
}

fn plan(config: SessionConfig, aspeed: Option<String>, main: Option<String>) -> Result<()> {
    let config = SessionConfig {
        aspeed_firmware_path: aspeed.or(config.aspeed_firmware_path),
        main_firmware_path: main.or(config.main_firmware_path),
        ..config
    };
    let images = FirmwareImages::load(&config)?;

    println!("A-Speed image: {} bytes", images.aspeed.len());
    for (i, chunk) in chunk_plan(&images.aspeed).iter().enumerate() {
        println!(
            "  chunk {:3}  0x{:08X}  {:4} bytes  checksum 0x{:04X}",
            i,
            chunk.address,
            chunk.len,
            chunk.checksum & 0xFFFF
        );
    }
    println!(
        "Main image: {} bytes, checksum 0x{:04X}",
        images.main.len(),
        main_image_checksum(&images.main) & 0xFFFF
    );
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    SessionConfig::default().save_to_file(path)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

fn synthetic_images() -> Result<FirmwareImages> {
    let aspeed = (0..2048u32).map(|i| (i % 251) as u8).collect();
    let main = (0..16384u32).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    Ok(FirmwareImages::new(aspeed, main)?)
}

/// A finger sliding diagonally across the surface.
fn synthetic_finger(id: u8, frame: u8, width: i32, height: i32) -> FingerRecord {
    let step = i32::from(frame) * 40 + i32::from(id) * 600;
    let x = (300 + step).min(width.max(1) - 1);
    let y = (500 + step).min(height.max(1) - 1);
    FingerRecord {
        id,
        event: 0x03,
        x: i16::try_from(x).unwrap_or(i16::MAX),
        y: i16::try_from(y).unwrap_or(i16::MAX),
        size_major: 40,
        size_minor: 32,
        orientation: (MAX_FINGER_ORIENTATION / 2) as u16,
        force_major: 260,
        force_minor: 220,
        ..Default::default()
    }
}

fn print_event(event: &TouchEvent) {
    match event {
        TouchEvent::Contact(obs) => println!(
            "  contact id={} x={} y={} touch={}/{} width={}/{} orientation={}",
            obs.tracking_id,
            obs.x,
            obs.y,
            obs.touch_major,
            obs.touch_minor,
            obs.width_major,
            obs.width_minor,
            obs.orientation
        ),
        TouchEvent::ContactEnd => println!("  contact end"),
        TouchEvent::SingleTouch { x, y } => println!("  single touch x={} y={}", x, y),
        TouchEvent::Button { touching } => println!("  touch button {}", touching),
        TouchEvent::Sync => println!("  sync"),
    }
}
