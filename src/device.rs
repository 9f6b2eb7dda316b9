// device.rs: device-side sampling loop and manual-calibration state machine
//
//   IDLE ──SCAL──▶ COLLECTING ──window full / failsafe──▶ ESTIMATING ──▶ IDLE
//
// Every tick emits exactly one `Measurement:` line, collecting or not. The tick
// that closes a collection window emits the `Calibration:` line first, and the
// new model is installed at that point, so the same tick's attitude already
// uses it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;

use crate::calibration::{CalibrationEstimator, CalibrationHandle, CalibrationModel};
use crate::compass::Direction;
use crate::config::{LeadingTriple, TrackerConfig};
use crate::error::{FusionError, TrackerResult};
use crate::filters::{FqaEstimator, OrientationFix};
use crate::protocol::{Command, CommandBuffer, TelemetryLine, LINE_TERMINATOR};
use crate::types::{MagSample, Measurement, SensorTick};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    CalibrationFallback(FusionError),
    CalibrationStarted { at: f64 },
    CollectionTimedOut { samples: usize, elapsed_secs: f64 },
    CalibrationInstalled(CalibrationModel),
    CalibrationRejected(FusionError),
    AccelDegenerate(FusionError),
    MagDegenerate { held_yaw: f64 },
    CommandIgnored(String),
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Idle,
    Collecting,
    /// Transient: entered and left inside the `tick` that closes the window,
    /// so `Device::state()` never reports it between calls.
    Estimating,
}

enum Phase {
    Idle,
    /// `started_at` is unset until the first tick when no tick has been seen yet
    Collecting { samples: Vec<MagSample>, started_at: Option<f64> },
    Estimating { samples: Vec<MagSample> },
}

impl Phase {
    fn state(&self) -> DeviceState {
        match self {
            Phase::Idle => DeviceState::Idle,
            Phase::Collecting { .. } => DeviceState::Collecting,
            Phase::Estimating { .. } => DeviceState::Estimating,
        }
    }
}

/// Everything one tick produced.
#[derive(Clone, Debug)]
pub struct TickOutput {
    /// Wire lines in emission order, terminators included
    pub lines: Vec<String>,
    pub fix: OrientationFix,
    pub heading: Direction,
    pub events: Vec<FusionEvent>,
}

pub struct Device {
    calibration: CalibrationHandle,
    estimator: Box<dyn CalibrationEstimator + Send + Sync>,
    fqa: FqaEstimator,
    commands: CommandBuffer,
    phase: Phase,

    leading_triple: LeadingTriple,
    precision: usize,
    collect_samples: usize,
    max_collect_secs: f64,

    clock: f64,
    ticks: u64,
    pending_events: Vec<FusionEvent>,
}

impl Device {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            calibration: CalibrationHandle::new(config.calibration.defaults),
            estimator: config.calibration.method.build(config.calibration.min_samples),
            fqa: FqaEstimator::new(&config.fusion),
            commands: CommandBuffer::new(config.protocol.command_buffer),
            phase: Phase::Idle,
            leading_triple: config.protocol.leading_triple,
            precision: config.protocol.measurement_precision,
            collect_samples: config.calibration.collect_samples.max(1),
            max_collect_secs: config.calibration.max_collect_secs,
            clock: 0.0,
            ticks: 0,
            pending_events: Vec::new(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.phase.state()
    }

    /// Shared read access to the active calibration
    pub fn calibration_handle(&self) -> CalibrationHandle {
        self.calibration.clone()
    }

    pub fn calibration(&self) -> Arc<CalibrationModel> {
        self.calibration.load()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Announces the compiled-in constants before the first measurement.
    pub fn startup_line(&self) -> String {
        let model = self.calibration.load();
        log::info!("Active calibration: {}", model);
        wire(TelemetryLine::Calibration(*model).encode(self.precision))
    }

    /// Feed bytes received from the host.
    pub fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if let Some(command) = self.commands.push(byte) {
                self.handle_command(command);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match (command, &self.phase) {
            (Command::ManualCalibration, Phase::Idle) => {
                log::info!("Manual calibration requested, collecting up to {} samples", self.collect_samples);
                self.phase = Phase::Collecting {
                    samples: Vec::with_capacity(self.collect_samples),
                    started_at: (self.ticks > 0).then_some(self.clock),
                };
                self.pending_events.push(FusionEvent::CalibrationStarted { at: self.clock });
            }
            (Command::ManualCalibration, _) => {
                log::debug!("Calibration already in progress, ignoring SCAL");
                self.pending_events
                    .push(FusionEvent::CommandIgnored("SCAL".to_string()));
            }
            (Command::Unknown(text), _) => {
                log::debug!("Unknown command {:?}", text);
                self.pending_events.push(FusionEvent::CommandIgnored(text));
            }
        }
    }

    /// One sampling cycle. Never fails: every fault is downgraded to an event.
    pub fn tick(&mut self, sample: &SensorTick) -> TickOutput {
        self.clock = sample.timestamp;
        self.ticks += 1;

        let mut events = std::mem::take(&mut self.pending_events);
        let mut lines = Vec::with_capacity(2);

        self.advance_calibration(sample, &mut lines, &mut events);

        // Attitude always sees whatever model is active after this tick's transition.
        let model = self.calibration.load();
        let (mag, fallback) = model.apply_or_identity(&sample.mag.as_vec3());
        if let Some(e) = fallback {
            events.push(FusionEvent::CalibrationFallback(e));
        }

        let fix = self.fqa.update(&sample.raw.accel, &mag);
        match &fix.fault {
            Some(FusionError::DegenerateMag { .. }) => events.push(FusionEvent::MagDegenerate {
                held_yaw: self.fqa.last_yaw(),
            }),
            Some(e) => events.push(FusionEvent::AccelDegenerate(e.clone())),
            None => {}
        }

        let leading = match self.leading_triple {
            LeadingTriple::Gyro => sample.raw.gyro,
            LeadingTriple::Mag => mag,
        };
        let measurement = TelemetryLine::Measurement(Measurement::new(leading, sample.raw.accel));
        lines.push(wire(measurement.encode(self.precision)));

        TickOutput {
            lines,
            heading: Direction::from_heading(fix.euler.yaw),
            fix,
            events,
        }
    }

    fn advance_calibration(
        &mut self,
        sample: &SensorTick,
        lines: &mut Vec<String>,
        events: &mut Vec<FusionEvent>,
    ) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let next = match phase {
            Phase::Idle => Phase::Idle,
            Phase::Collecting { mut samples, started_at } => {
                samples.push(sample.mag);
                let started_at = started_at.unwrap_or(self.clock);
                let elapsed = self.clock - started_at;
                if samples.len() >= self.collect_samples {
                    Phase::Estimating { samples }
                } else if elapsed >= self.max_collect_secs {
                    log::warn!(
                        "Calibration window timed out after {:.1}s with {} samples",
                        elapsed,
                        samples.len()
                    );
                    events.push(FusionEvent::CollectionTimedOut {
                        samples: samples.len(),
                        elapsed_secs: elapsed,
                    });
                    Phase::Estimating { samples }
                } else {
                    Phase::Collecting {
                        samples,
                        started_at: Some(started_at),
                    }
                }
            }
            estimating @ Phase::Estimating { .. } => estimating,
        };

        self.phase = match next {
            Phase::Estimating { samples } => {
                let model = self.finish_calibration(&samples, events);
                lines.push(wire(TelemetryLine::Calibration(model).encode(self.precision)));
                Phase::Idle
            }
            other => other,
        };
    }

    /// ESTIMATING → IDLE. Returns the model that is active afterwards.
    fn finish_calibration(
        &mut self,
        samples: &[MagSample],
        events: &mut Vec<FusionEvent>,
    ) -> CalibrationModel {
        let result = self
            .estimator
            .estimate(samples)
            .and_then(|model| self.calibration.update(model).map(|_| model));

        match result {
            Ok(model) => {
                log::info!("New calibration from {} samples: {}", samples.len(), model);
                events.push(FusionEvent::CalibrationInstalled(model));
                model
            }
            Err(e) => {
                log::warn!("Calibration failed ({}), keeping previous model", e);
                events.push(FusionEvent::CalibrationRejected(e));
                *self.calibration.load()
            }
        }
    }
}

fn wire(line: String) -> String {
    line + LINE_TERMINATOR
}

// ─── Serial loop ─────────────────────────────────────────────────────────────

/// Drive a device from a sample channel over a duplex byte link until the
/// sample source closes. A host that hangs up only stops command input.
pub async fn serve<L>(mut device: Device, mut ticks: Receiver<SensorTick>, link: L) -> TrackerResult<u64>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(link);
    writer.write_all(device.startup_line().as_bytes()).await?;

    let mut buf = [0u8; 64];
    let mut host_open = true;
    loop {
        tokio::select! {
            tick = ticks.recv() => {
                let Some(tick) = tick else { break };
                let out = device.tick(&tick);
                for line in &out.lines {
                    writer.write_all(line.as_bytes()).await?;
                }
                for event in &out.events {
                    log::debug!("device event: {:?}", event);
                }
            }
            read = reader.read(&mut buf), if host_open => {
                match read? {
                    0 => host_open = false,
                    n => device.receive(&buf[..n]),
                }
            }
        }
    }
    writer.flush().await?;
    Ok(device.ticks())
}
