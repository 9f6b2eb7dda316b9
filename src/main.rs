use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};

use sphere_tracker::calibration::EstimatorKind;
use sphere_tracker::config::LeadingTriple;
use sphere_tracker::device::{self, Device};
use sphere_tracker::error::FusionError;
use sphere_tracker::host::{HostEvent, HostLink};
use sphere_tracker::sensors::{self, SyntheticImu, SyntheticMotion};
use sphere_tracker::{Direction, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "sphere_tracker")]
#[command(about = "Magnetometer calibration and orientation fusion over a serial telemetry link", long_about = None)]
struct Args {
    /// JSON configuration file (missing fields take defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Layout of the first Measurement triple (gyro, mag)
    #[arg(long, global = true)]
    layout: Option<LeadingTriple>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Decode a live device stream
    Listen {
        /// Serial device node, opened 8N1
        #[arg(long, value_name = "PATH")]
        device: PathBuf,

        /// Line rate (defaults to protocol.baud_rate, 115200)
        #[arg(long)]
        baud: Option<u32>,

        /// Seconds to run (0 = continuous)
        #[arg(long, default_value = "0")]
        duration: u64,

        /// Send SCAL after this many seconds and wait for the answer
        #[arg(long, value_name = "SECONDS")]
        calibrate_after: Option<u64>,
    },
    /// Run the device state machine against a synthetic sensor in-process
    Simulate {
        /// Seconds to run
        #[arg(long, default_value = "10")]
        duration: u64,

        #[arg(long, value_name = "SECONDS")]
        calibrate_after: Option<u64>,

        /// Calibration estimator (min_max, ellipsoid)
        #[arg(long)]
        method: Option<EstimatorKind>,

        /// Synthetic sample rate
        #[arg(long, default_value = "50")]
        rate_hz: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(layout) = args.layout {
        config.protocol.leading_triple = layout;
    }

    match args.mode {
        Mode::Listen {
            device,
            baud,
            duration,
            calibrate_after,
        } => {
            if let Some(baud) = baud {
                config.protocol.baud_rate = baud;
            }
            listen(config, device, duration, calibrate_after).await
        }
        Mode::Simulate {
            duration,
            calibrate_after,
            method,
            rate_hz,
        } => {
            if let Some(method) = method {
                config.calibration.method = method;
            }
            simulate(config, duration, calibrate_after, rate_hz).await
        }
    }
}

async fn listen(
    config: TrackerConfig,
    device: PathBuf,
    duration: u64,
    calibrate_after: Option<u64>,
) -> Result<()> {
    config.validate()?;
    println!("[{}] Sphere Tracker listening", ts_now());
    println!("  Device: {}", device.display());
    println!("  Duration: {} seconds (0=continuous)", duration);
    println!("  Baud: {}", config.protocol.baud_rate);
    println!("  Layout: {:?}", config.protocol.leading_triple);

    let port = tokio_serial::new(device.to_string_lossy(), config.protocol.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
        .with_context(|| format!("opening {}", device.display()))?;

    let link = HostLink::new(port, &config);
    run_host(link, duration, calibrate_after).await
}

async fn simulate(
    config: TrackerConfig,
    duration: u64,
    calibrate_after: Option<u64>,
    rate_hz: f64,
) -> Result<()> {
    config.validate()?;
    println!("[{}] Sphere Tracker simulation", ts_now());
    println!("  Duration: {} seconds", duration);
    println!("  Rate: {:.0} Hz", rate_hz);
    println!("  Method: {:?}", config.calibration.method);

    let (device_end, host_end) = tokio::io::duplex(64 * 1024);
    let (tick_tx, tick_rx) = mpsc::channel(500);

    let imu = SyntheticImu::new(SyntheticMotion {
        rate_hz,
        ..SyntheticMotion::default()
    });
    let ticks = (duration as f64 * rate_hz).round() as u64;
    let _sensor_handle = tokio::spawn(sensors::sensor_loop(tick_tx, imu, Some(ticks)));
    let device_handle = tokio::spawn(device::serve(Device::new(&config), tick_rx, device_end));

    let link = HostLink::new(host_end, &config);
    run_host(link, 0, calibrate_after).await?;

    let device_ticks = device_handle.await??;
    println!("[{}] Device produced {} ticks", ts_now(), device_ticks);
    Ok(())
}

/// Shared host loop: log every decoded event until the link closes or the
/// duration runs out, issuing one calibration request if asked.
async fn run_host<T>(mut link: HostLink<T>, duration: u64, calibrate_after: Option<u64>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let start = Instant::now();
    let deadline = (duration > 0).then(|| start + Duration::from_secs(duration));
    let calibrate_at = calibrate_after.map(|s| start + Duration::from_secs(s));
    let mut requested = false;
    let far = start + Duration::from_secs(365 * 24 * 3600);

    loop {
        tokio::select! {
            event = link.next_event() => match event {
                Ok(event) => report(&link, &event),
                Err(FusionError::NotConnected) => {
                    println!("[{}] Link closed", ts_now());
                    break;
                }
                Err(e) => return Err(e.into()),
            },
            _ = sleep_until(calibrate_at.unwrap_or(far)), if calibrate_at.is_some() && !requested => {
                requested = true;
                println!("[{}] Requesting calibration...", ts_now());
                match link.request_calibration().await {
                    Ok(model) => println!("[{}] Calibration: {}", ts_now(), model),
                    Err(e) => println!("[{}] Calibration request failed: {}", ts_now(), e),
                }
            }
            _ = sleep_until(deadline.unwrap_or(far)), if deadline.is_some() => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
        }
    }

    let mirror = link.mirror();
    println!("\n=== Final Stats ===");
    println!("Measurements: {}", mirror.measurements());
    println!("Discarded lines: {}", mirror.discarded());
    println!("Active calibration: {}", mirror.calibration());
    Ok(())
}

fn report<T>(link: &HostLink<T>, event: &HostEvent)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    match event {
        HostEvent::Measurement { fix: Some(fix), .. } => {
            let deg = fix.euler.to_degrees();
            log::info!(
                "yaw {:7.2}  pitch {:7.2}  roll {:7.2}  {}{}",
                deg.yaw,
                deg.pitch,
                deg.roll,
                Direction::from_heading(fix.euler.yaw),
                if fix.reliable { "" } else { "  (held)" }
            );
        }
        HostEvent::Measurement { measurement, fix: None } => {
            if link.mirror().measurements() % 50 == 0 {
                log::info!(
                    "gyro ({:.2}, {:.2}, {:.2})  accel ({:.2}, {:.2}, {:.2})",
                    measurement.leading.x,
                    measurement.leading.y,
                    measurement.leading.z,
                    measurement.accel.x,
                    measurement.accel.y,
                    measurement.accel.z
                );
            }
        }
        HostEvent::CalibrationChanged(model) => {
            println!("[{}] Device calibration: {}", ts_now(), model);
        }
        HostEvent::CalibrationRejected { model, error } => {
            println!("[{}] Rejected device calibration {}: {}", ts_now(), model, error);
        }
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
