use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use clap::Parser;
use flate2::read::GzDecoder;
use serde_json::json;
use sphere_tracker::config::{LeadingTriple, TrackerConfig};
use sphere_tracker::host::{HostEvent, HostMirror};

#[derive(Parser, Debug)]
#[command(about = "Replay captured telemetry through the host decoder", long_about = None)]
struct Args {
    /// Captured serial stream (*.log or *.log.gz)
    #[arg(long, conflicts_with = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of captures to batch replay
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Layout of the first Measurement triple (gyro, mag)
    #[arg(long)]
    layout: Option<LeadingTriple>,

    /// Print per-measurement records as JSON lines before the summary
    #[arg(long, default_value_t = false)]
    records: bool,
}

fn open_log(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let inner: Box<dyn Read> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}

fn is_capture(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".log") || name.ends_with(".log.gz")
}

fn run_once(path: &Path, config: &TrackerConfig, args: &Args) -> anyhow::Result<serde_json::Value> {
    let mut reader = open_log(path)?;
    let mut mirror = HostMirror::new(config);

    let mut calibrations = Vec::new();
    let mut rejected = 0u64;
    let mut unreliable = 0u64;
    let mut chunk = Vec::with_capacity(256);

    // Bytes go in unsplit so the decoder sees the capture exactly as the port did.
    loop {
        chunk.clear();
        let n = reader.read_until(b'\n', &mut chunk)?;
        if n == 0 {
            break;
        }
        for event in mirror.push(&chunk) {
            match &event {
                HostEvent::Measurement { fix, .. } => {
                    if fix.as_ref().map_or(false, |f| !f.reliable) {
                        unreliable += 1;
                    }
                    if args.records {
                        if let Some(record) = mirror.record(&event) {
                            println!("{}", serde_json::to_string(&record)?);
                        }
                    }
                }
                HostEvent::CalibrationChanged(model) => calibrations.push(model.to_fields()),
                HostEvent::CalibrationRejected { .. } => rejected += 1,
            }
        }
    }

    Ok(json!({
        "log": path.display().to_string(),
        "layout": config.protocol.leading_triple,
        "measurements": mirror.measurements(),
        "unreliable": unreliable,
        "discarded_lines": mirror.discarded(),
        "calibrations": calibrations,
        "rejected_calibrations": rejected,
        "final_calibration": *mirror.calibration(),
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(layout) = args.layout {
        config.protocol.leading_triple = layout;
    }

    let mut results = Vec::new();
    if let Some(dir) = args.log_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_capture(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &config, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &config, &args)?);
    } else {
        anyhow::bail!("Provide --log or --log-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
