//! Host side of the telemetry link.
//!
//! `HostMirror` is the synchronous core: bytes in, decoded events out, with
//! the device's active calibration mirrored locally. `HostLink` wraps it
//! around an async byte stream and adds the `SCAL` request/response.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::calibration::{CalibrationHandle, CalibrationModel};
use crate::config::{LeadingTriple, TrackerConfig};
use crate::error::{FusionError, TrackerResult};
use crate::filters::{EulerAngles, FqaEstimator, OrientationFix};
use crate::protocol::{LineDecoder, TelemetryLine, CALIBRATE_COMMAND, LINE_TERMINATOR};
use crate::types::{Measurement, Vec3};

#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    /// `fix` is present only when the leading triple carries the field
    Measurement {
        measurement: Measurement,
        fix: Option<OrientationFix>,
    },
    CalibrationChanged(CalibrationModel),
    /// The device announced a model this side refuses to apply
    CalibrationRejected {
        model: CalibrationModel,
        error: FusionError,
    },
}

/// One row of host output, for logs and JSON export.
#[derive(Clone, Debug, Serialize)]
pub struct AttitudeRecord {
    pub index: u64,
    pub gyro: Option<[f64; 3]>,
    pub accel: [f64; 3],
    pub euler: Option<EulerAngles>,
    pub reliable: bool,
}

pub struct HostMirror {
    decoder: LineDecoder,
    layout: LeadingTriple,
    calibration: CalibrationHandle,
    fqa: FqaEstimator,
    measurements: u64,
}

impl HostMirror {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            decoder: LineDecoder::new(),
            layout: config.protocol.leading_triple,
            calibration: CalibrationHandle::new(config.calibration.defaults),
            fqa: FqaEstimator::new(&config.fusion),
            measurements: 0,
        }
    }

    pub fn calibration(&self) -> Arc<CalibrationModel> {
        self.calibration.load()
    }

    pub fn measurements(&self) -> u64 {
        self.measurements
    }

    pub fn discarded(&self) -> u64 {
        self.decoder.discarded()
    }

    /// Decode `data` and process every line it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<HostEvent> {
        self.decoder.push(data);
        let mut events = Vec::new();
        while let Some(line) = self.decoder.next_line() {
            events.push(self.process(line));
        }
        events
    }

    pub fn process(&mut self, line: TelemetryLine) -> HostEvent {
        match line {
            TelemetryLine::Measurement(measurement) => {
                self.measurements += 1;
                // The legacy layout already carries the calibrated field.
                let fix = match self.layout {
                    LeadingTriple::Mag => {
                        Some(self.fqa.update(&measurement.accel, &measurement.leading))
                    }
                    LeadingTriple::Gyro => None,
                };
                HostEvent::Measurement { measurement, fix }
            }
            TelemetryLine::Calibration(model) => match self.calibration.update(model) {
                Ok(()) => {
                    log::info!("Device calibration: {}", model);
                    HostEvent::CalibrationChanged(model)
                }
                Err(error) => {
                    log::warn!("Ignoring device calibration {}: {}", model, error);
                    HostEvent::CalibrationRejected { model, error }
                }
            },
        }
    }

    /// Flatten a measurement event into an exportable row.
    pub fn record(&self, event: &HostEvent) -> Option<AttitudeRecord> {
        let HostEvent::Measurement { measurement, fix } = event else {
            return None;
        };
        let gyro = match self.layout {
            LeadingTriple::Gyro => Some(triple(&measurement.leading)),
            LeadingTriple::Mag => None,
        };
        Some(AttitudeRecord {
            index: self.measurements,
            gyro,
            accel: triple(&measurement.accel),
            euler: fix.as_ref().map(|f| f.euler),
            reliable: fix.as_ref().map_or(true, |f| f.reliable),
        })
    }
}

fn triple(v: &Vec3) -> [f64; 3] {
    [v.x, v.y, v.z]
}

// ─── Async link ──────────────────────────────────────────────────────────────

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const READ_CHUNK: usize = 512;

/// Owns the read half of the link. Bytes leave through the channel as soon as
/// they arrive; a clean close drops the sender.
async fn reader_loop<R>(mut rd: R, tx: mpsc::Sender<TrackerResult<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                log::info!("[host] Device closed the link");
                break;
            }
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("[host] Read failed: {}", e);
                let _ = tx.send(Err(e.into())).await;
                break;
            }
        }
    }
}

/// Async host end of the link.
///
/// Reading happens in a dedicated task, so dropping a pending `next_event`
/// never leaves a read in flight on the port when `request_calibration`
/// writes.
pub struct HostLink<T> {
    writer: WriteHalf<T>,
    incoming: mpsc::Receiver<TrackerResult<Vec<u8>>>,
    reader: JoinHandle<()>,
    mirror: HostMirror,
    pending: VecDeque<HostEvent>,
    request_timeout: Duration,
}

impl<T> HostLink<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: T, config: &TrackerConfig) -> Self {
        let (rd, writer) = tokio::io::split(io);
        let (tx, incoming) = mpsc::channel(64);
        let reader = tokio::spawn(reader_loop(rd, tx));
        let request_timeout = Duration::try_from_secs_f64(config.protocol.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Self {
            writer,
            incoming,
            reader,
            mirror: HostMirror::new(config),
            pending: VecDeque::new(),
            request_timeout,
        }
    }

    pub fn mirror(&self) -> &HostMirror {
        &self.mirror
    }

    /// Decode whatever the reader delivers next into the queue.
    async fn fill(&mut self) -> TrackerResult<()> {
        match self.incoming.recv().await {
            Some(Ok(chunk)) => {
                let events = self.mirror.push(&chunk);
                self.pending.extend(events);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Err(FusionError::NotConnected),
        }
    }

    /// Next decoded event. `NotConnected` once the device side closes.
    ///
    /// Cancel safe: a dropped call loses no bytes and leaves the port idle.
    pub async fn next_event(&mut self) -> TrackerResult<HostEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            self.fill().await?;
        }
    }

    /// Send `SCAL` and wait for the device's `Calibration:` answer.
    ///
    /// Measurements that arrive meanwhile stay queued for `next_event`. The
    /// device answers even when estimation fails (with the model it kept), so
    /// a timeout means the link itself is unhealthy.
    ///
    /// The answer is the first `Calibration:` line received after the command
    /// is written. The line carries no request id, so a device that reboots
    /// while the request is pending is answered by its boot announcement.
    pub async fn request_calibration(&mut self) -> TrackerResult<CalibrationModel> {
        // Events already queued predate the request and can't be its answer.
        let from = self.pending.len();

        let mut command = CALIBRATE_COMMAND.to_vec();
        command.extend_from_slice(LINE_TERMINATOR.as_bytes());
        self.writer.write_all(&command).await?;
        self.writer.flush().await?;
        log::info!("Calibration requested");

        let limit = self.request_timeout;
        let answer = tokio::time::timeout(limit, self.await_calibration(from)).await;
        answer.unwrap_or_else(|_| {
            log::warn!("No calibration answer after {:?}", limit);
            Err(FusionError::Timeout)
        })
    }

    /// Fills the queue until a calibration event shows up past `from`, then
    /// takes that one event out. Dropping the future loses nothing.
    async fn await_calibration(&mut self, from: usize) -> TrackerResult<CalibrationModel> {
        let mut scanned = from;
        loop {
            while scanned < self.pending.len() {
                let answer = match &self.pending[scanned] {
                    HostEvent::CalibrationChanged(model) => Ok(*model),
                    HostEvent::CalibrationRejected { error, .. } => Err(error.clone()),
                    HostEvent::Measurement { .. } => {
                        scanned += 1;
                        continue;
                    }
                };
                self.pending.remove(scanned);
                return answer;
            }
            self.fill().await?;
        }
    }
}

impl<T> Drop for HostLink<T> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn config(layout: LeadingTriple) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.protocol.leading_triple = layout;
        config
    }

    #[test]
    fn test_mirror_tracks_device_calibration() {
        let mut mirror = HostMirror::new(&config(LeadingTriple::Gyro));
        assert_eq!(*mirror.calibration(), CalibrationModel::factory());

        let events = mirror.push(b"Calibration: 0, 100, 0, 500, 200, 50, 250\r\n");
        let expected =
            CalibrationModel::new(Vec3::new(0.0, 100.0, 0.0), Vec3::new(500.0, 200.0, 50.0), 250.0);
        assert_eq!(events, vec![HostEvent::CalibrationChanged(expected)]);
        assert_eq!(*mirror.calibration(), expected);
    }

    #[test]
    fn test_mirror_refuses_zero_scale() {
        let mut mirror = HostMirror::new(&config(LeadingTriple::Gyro));
        let events = mirror.push(b"Calibration: 0, 0, 0, 0, 1, 1, 1\n");
        assert!(matches!(
            events.as_slice(),
            [HostEvent::CalibrationRejected { error: FusionError::Configuration(_), .. }]
        ));
        assert_eq!(*mirror.calibration(), CalibrationModel::factory());
    }

    #[test]
    fn test_gyro_layout_has_no_fix() {
        let mut mirror = HostMirror::new(&config(LeadingTriple::Gyro));
        let events = mirror.push(b"Measurement: 0.10, 0.20, 0.30, 0.00, 0.00, 1.00\r\n");
        let record = mirror.record(&events[0]).unwrap();
        assert_eq!(record.gyro, Some([0.1, 0.2, 0.3]));
        assert!(record.euler.is_none());
        assert_eq!(mirror.measurements(), 1);
    }

    #[test]
    fn test_mag_layout_yields_attitude() {
        let mut mirror = HostMirror::new(&config(LeadingTriple::Mag));
        let events = mirror.push(b"Measurement: 0.00, 1.00, 0.00, 0.00, 0.00, 1.00\r\n");
        let record = mirror.record(&events[0]).unwrap();
        let euler = record.euler.unwrap();
        assert_abs_diff_eq!(euler.yaw, FRAC_PI_2, epsilon = 1e-9);
        assert_abs_diff_eq!(euler.pitch, 0.0, epsilon = 1e-9);
        assert!(record.reliable);
        assert!(record.gyro.is_none());
    }

    #[test]
    fn test_noise_between_lines_counted() {
        let mut mirror = HostMirror::new(&config(LeadingTriple::Gyro));
        let events = mirror.push(b"\x00\xffgarbage\r\nMeasurement: 1, 2, 3, 4, 5, 6\r\nMeasurement: 1, 2\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(mirror.discarded(), 2);
    }

    #[tokio::test]
    async fn test_request_calibration_keeps_measurements() {
        let (host_end, device_end) = tokio::io::duplex(1024);
        let mut link = HostLink::new(host_end, &config(LeadingTriple::Gyro));

        let device = tokio::spawn(async move {
            let (rd, mut wr) = tokio::io::split(device_end);
            let mut rd = BufReader::new(rd);
            let mut command = String::new();
            rd.read_line(&mut command).await.unwrap();
            assert_eq!(command, "SCAL\r\n");
            wr.write_all(b"Measurement: 0.00, 0.00, 0.00, 0.00, 0.00, 1.00\r\n").await.unwrap();
            wr.write_all(b"Calibration: 1, 2, 3, 4, 5, 6, 7\r\n").await.unwrap();
            wr.write_all(b"Measurement: 1.00, 0.00, 0.00, 0.00, 0.00, 1.00\r\n").await.unwrap();
            wr.flush().await.unwrap();
            // Keep the stream open until the host has read everything.
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let model = link.request_calibration().await.unwrap();
        assert_eq!(model.to_fields(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(*link.mirror().calibration(), model);

        let first = link.next_event().await.unwrap();
        let second = link.next_event().await.unwrap();
        match (first, second) {
            (
                HostEvent::Measurement { measurement: a, .. },
                HostEvent::Measurement { measurement: b, .. },
            ) => {
                assert_eq!(a.leading.x, 0.0);
                assert_eq!(b.leading.x, 1.0);
            }
            other => panic!("unexpected events {:?}", other),
        }
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_calibration_times_out() {
        let (host_end, _device_end) = tokio::io::duplex(1024);
        let mut cfg = config(LeadingTriple::Gyro);
        cfg.protocol.request_timeout_secs = 0.05;
        let mut link = HostLink::new(host_end, &cfg);
        assert_eq!(link.request_calibration().await, Err(FusionError::Timeout));
    }

    #[tokio::test]
    async fn test_request_after_cancelled_read() {
        let (host_end, device_end) = tokio::io::duplex(1024);
        let mut link = HostLink::new(host_end, &config(LeadingTriple::Gyro));
        let (rd, mut wr) = tokio::io::split(device_end);

        // Nothing on the wire yet, so the timer wins and the read is dropped.
        tokio::select! {
            event = link.next_event() => panic!("unexpected event {:?}", event),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        wr.write_all(b"Measurement: 0.50, 0.00, 0.00, 0.00, 0.00, 1.00\r\n").await.unwrap();
        let device = tokio::spawn(async move {
            let mut rd = BufReader::new(rd);
            let mut command = String::new();
            rd.read_line(&mut command).await.unwrap();
            wr.write_all(b"Calibration: 1, 2, 3, 4, 5, 6, 7\r\n").await.unwrap();
            wr.flush().await.unwrap();
            (command, rd, wr)
        });

        let model = link.request_calibration().await.unwrap();
        assert_eq!(model.to_fields(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let (command, _rd, _wr) = device.await.unwrap();
        assert_eq!(command, "SCAL\r\n");

        match link.next_event().await.unwrap() {
            HostEvent::Measurement { measurement, .. } => assert_eq!(measurement.leading.x, 0.5),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(link.mirror().measurements(), 1);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_falls_back() {
        for secs in [1e30, f64::NAN, -1.0] {
            let (host_end, _device_end) = tokio::io::duplex(64);
            let mut cfg = config(LeadingTriple::Gyro);
            cfg.protocol.request_timeout_secs = secs;
            let link = HostLink::new(host_end, &cfg);
            assert_eq!(link.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        }
    }

    #[tokio::test]
    async fn test_closed_link_reports_not_connected() {
        let (host_end, device_end) = tokio::io::duplex(64);
        drop(device_end);
        let mut link = HostLink::new(host_end, &config(LeadingTriple::Gyro));
        assert_eq!(link.next_event().await, Err(FusionError::NotConnected));
    }

    #[tokio::test]
    async fn test_full_exchange_with_device() {
        use crate::device::{serve, Device};
        use crate::types::{MagSample, RawSample, SensorTick};
        use tokio::sync::mpsc;

        let mut cfg = TrackerConfig::default();
        cfg.calibration.collect_samples = 6;
        let (host_end, device_end) = tokio::io::duplex(8192);
        let (tx, rx) = mpsc::channel(64);
        let server = tokio::spawn(serve(Device::new(&cfg), rx, device_end));

        let mut link = HostLink::new(host_end, &cfg);
        // Boot announcement.
        assert!(matches!(
            link.next_event().await.unwrap(),
            HostEvent::CalibrationChanged(m) if m == CalibrationModel::factory()
        ));

        let feeder = tokio::spawn(async move {
            let extremes = [
                (500.0, 100.0, 0.0),
                (-500.0, 100.0, 0.0),
                (0.0, 300.0, 0.0),
                (0.0, -100.0, 0.0),
                (0.0, 100.0, 50.0),
                (0.0, 100.0, -50.0),
            ];
            for i in 0..200 {
                let (x, y, z) = extremes[i % extremes.len()];
                let tick = SensorTick {
                    timestamp: i as f64 * 0.01,
                    raw: RawSample::new(Vec3::zeros(), Vec3::new(0.0, 0.0, 1.0)),
                    mag: MagSample::new(x, y, z),
                };
                if tx.send(tick).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let model = link.request_calibration().await.unwrap();
        assert_eq!(model.to_fields(), [0.0, 100.0, 0.0, 500.0, 200.0, 50.0, 250.0]);

        let mut measurements = 0;
        while let Ok(event) = link.next_event().await {
            if let HostEvent::Measurement { .. } = event {
                measurements += 1;
            }
        }
        feeder.await.unwrap();
        let ticks = server.await.unwrap().unwrap();
        assert_eq!(link.mirror().measurements(), ticks);
        assert!(measurements > 0);
    }
}
