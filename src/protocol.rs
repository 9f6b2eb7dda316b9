//! Line-oriented telemetry protocol
//!
//! Device → host, one ASCII line per message, `\r\n` terminated:
//!   `Measurement: <x>, <y>, <z>, <ax>, <ay>, <az>`
//!   `Calibration: <cx>, <cy>, <cz>, <sx>, <sy>, <sz>, <radius>`
//!
//! Host → device: the 4-byte token `SCAL` requests a manual calibration.
//!
//! Framing is not byte-exact on a serial link, so the host decoder treats any
//! line it cannot read as noise and moves on.

use std::collections::VecDeque;

use crate::calibration::CalibrationModel;
use crate::error::ProtocolError;
use crate::types::{Measurement, Vec3};

pub const MEASUREMENT_PREFIX: &str = "Measurement:";
pub const CALIBRATION_PREFIX: &str = "Calibration:";
pub const CALIBRATE_COMMAND: &[u8] = b"SCAL";
pub const LINE_TERMINATOR: &str = "\r\n";

const MEASUREMENT_FIELDS: usize = 6;
const CALIBRATION_FIELDS: usize = 7;

/// A line the host can't terminate within this many bytes is noise.
const MAX_LINE_LEN: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryLine {
    Measurement(Measurement),
    Calibration(CalibrationModel),
}

impl TelemetryLine {
    pub fn encode(&self, precision: usize) -> String {
        match self {
            TelemetryLine::Measurement(m) => encode_measurement(m, precision),
            TelemetryLine::Calibration(c) => encode_calibration(c),
        }
    }
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Without terminator. Fixed precision keeps the line length steady at 115200 baud.
pub fn encode_measurement(m: &Measurement, precision: usize) -> String {
    let fields = [
        m.leading.x,
        m.leading.y,
        m.leading.z,
        m.accel.x,
        m.accel.y,
        m.accel.z,
    ];
    let body: Vec<String> = fields
        .iter()
        .map(|v| format!("{:.*}", precision, v))
        .collect();
    format!("{} {}", MEASUREMENT_PREFIX, body.join(", "))
}

/// Without terminator. Shortest round-trip formatting, so the host recovers
/// exactly the model the device installed.
pub fn encode_calibration(model: &CalibrationModel) -> String {
    let body: Vec<String> = model.to_fields().iter().map(|v| format!("{}", v)).collect();
    format!("{} {}", CALIBRATION_PREFIX, body.join(", "))
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn parse_fields<const N: usize>(body: &str) -> Result<[f64; N], ProtocolError> {
    let parts: Vec<&str> = body.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(ProtocolError::FieldCount {
            expected: N,
            found: parts.len(),
        });
    }
    let mut out = [0.0; N];
    for (slot, part) in out.iter_mut().zip(parts) {
        let value: f64 = part
            .parse()
            .map_err(|_| ProtocolError::InvalidNumber(part.to_string()))?;
        if !value.is_finite() {
            return Err(ProtocolError::InvalidNumber(part.to_string()));
        }
        *slot = value;
    }
    Ok(out)
}

/// Parse one line (terminator optional). Leading garbage before a known
/// prefix is skipped, which recovers lines glued to a torn fragment.
pub fn parse_line(line: &str) -> Result<TelemetryLine, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let measurement = line.find(MEASUREMENT_PREFIX);
    let calibration = line.find(CALIBRATION_PREFIX);
    match (measurement, calibration) {
        (Some(m), c) if c.map_or(true, |c| m < c) => {
            let [x, y, z, ax, ay, az] =
                parse_fields::<MEASUREMENT_FIELDS>(&line[m + MEASUREMENT_PREFIX.len()..])?;
            Ok(TelemetryLine::Measurement(Measurement::new(
                Vec3::new(x, y, z),
                Vec3::new(ax, ay, az),
            )))
        }
        (_, Some(c)) => {
            let fields = parse_fields::<CALIBRATION_FIELDS>(&line[c + CALIBRATION_PREFIX.len()..])?;
            Ok(TelemetryLine::Calibration(CalibrationModel::from_fields(fields)))
        }
        _ => Err(ProtocolError::UnknownPrefix),
    }
}

/// Host-side stream decoder: feed raw bytes, drain decoded lines.
///
/// Unreadable lines are counted and dropped. A trailing partial line stays
/// buffered until its terminator arrives and is discarded if it never does.
pub struct LineDecoder {
    buffer: Vec<u8>,
    ready: VecDeque<TelemetryLine>,
    discarded: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(128),
            ready: VecDeque::new(),
            discarded: 0,
        }
    }

    /// Append received bytes and decode every completed line.
    pub fn push(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' || byte == b'\r' {
                self.finish_line();
                continue;
            }
            if self.buffer.len() >= MAX_LINE_LEN {
                log::trace!("Dropping {} unterminated bytes", self.buffer.len());
                self.buffer.clear();
                self.discarded += 1;
            }
            self.buffer.push(byte);
        }
    }

    pub fn next_line(&mut self) -> Option<TelemetryLine> {
        self.ready.pop_front()
    }

    /// Lines dropped as noise so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn finish_line(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        match parse_line(&text) {
            Ok(line) => self.ready.push_back(line),
            Err(e) => {
                log::trace!("Discarding line {:?}: {}", text, e);
                self.discarded += 1;
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Device-side commands ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ManualCalibration,
    Unknown(String),
}

pub fn parse_command(bytes: &[u8]) -> Command {
    if bytes == CALIBRATE_COMMAND {
        Command::ManualCalibration
    } else {
        Command::Unknown(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Bounded command accumulator. `\r`, `\n`, or a full buffer ends a command.
pub struct CommandBuffer {
    buffer: Vec<u8>,
    capacity: usize,
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(CALIBRATE_COMMAND.len());
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<Command> {
        if byte == b'\r' || byte == b'\n' {
            if self.buffer.is_empty() {
                return None;
            }
            return Some(self.take());
        }
        self.buffer.push(byte);
        if self.buffer.len() >= self.capacity {
            return Some(self.take());
        }
        None
    }

    fn take(&mut self) -> Command {
        let command = parse_command(&self.buffer);
        self.buffer.clear();
        command
    }
}
