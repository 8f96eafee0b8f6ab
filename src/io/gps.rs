//! GPS feed - NMEA RMC sentences from a serial receiver
//!
//! Sentence (any talker, e.g. GP/GN):
//! `$GPRMC,hhmmss.ss,A,ddmm.mmmm,N,dddmm.mmmm,E,speed,course,ddmmyy,,,mode*CS`
//!
//! Only the newest fixes matter to the controller, so each parsed fix goes
//! into the overwrite-oldest position queue. A missing or unplugged receiver
//! is never fatal: the port is closed, and reopened after a fixed delay.

use crate::domain::types::PositionSample;
use crate::error::RmcError;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::context::{shutdown_requested, JourneyContext};
use crate::services::notifier::{JourneyNotice, JourneyObserver};
use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, trace, warn};

/// Longest line accepted; anything longer is skipped up to its newline
const MAX_SENTENCE_LEN: usize = 512;

/// Whether a raw line is an RMC sentence (from any talker)
pub fn is_rmc(raw: &str) -> bool {
    let line = raw.trim_start();
    let line = line.strip_prefix('$').unwrap_or(line);
    matches!(line.get(2..6), Some("RMC,"))
}

/// Parse an RMC sentence into a fix.
///
/// Returns `None` for anything else. A malformed or partial RMC sentence is
/// logged as a weak-signal warning; this never fails harder than that.
pub fn parse(raw: &str) -> Option<PositionSample> {
    match parse_rmc(raw) {
        Ok(sample) => Some(sample),
        Err(RmcError::NotRmc) => None,
        Err(e) => {
            warn!(reason = %e, "gps_weak_signal");
            None
        }
    }
}

/// Strict RMC parser behind [`parse`]
pub fn parse_rmc(raw: &str) -> Result<PositionSample, RmcError> {
    let line = raw.trim();
    let line = line.strip_prefix('$').unwrap_or(line);
    if !is_rmc(line) {
        return Err(RmcError::NotRmc);
    }

    let body = match line.split_once('*') {
        Some((body, checksum)) => {
            let expected =
                u8::from_str_radix(checksum.trim(), 16).map_err(|_| RmcError::Field("checksum"))?;
            let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
            if expected != computed {
                return Err(RmcError::Checksum { expected, computed });
            }
            body
        }
        None => line,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let field = |idx: usize, name: &'static str| non_empty(&fields, idx, name);

    if field(2, "status")? == "V" {
        return Err(RmcError::VoidFix);
    }

    let time = field(1, "time")?;
    let latitude = coordinate(field(3, "latitude")?, 2, 90.0, "latitude")?;
    let latitude = signed(latitude, field(4, "ns")?, "S", "N", "ns")?;
    let longitude = coordinate(field(5, "longitude")?, 3, 180.0, "longitude")?;
    let longitude = signed(longitude, field(6, "ew")?, "W", "E", "ew")?;
    let date = field(9, "date")?;

    let day = two_digits(date, 0, "date")?;
    let month = two_digits(date, 2, "date")?;
    let year = two_digits(date, 4, "date")?;
    let hour = two_digits(time, 0, "time")?;
    let minute = two_digits(time, 2, "time")?;
    let second = two_digits(time, 4, "time")?;

    let timestamp = NaiveDate::from_ymd_opt(2000 + year as i32, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or(RmcError::Field("date"))?
        .and_utc();

    Ok(PositionSample::new(timestamp, latitude, longitude))
}

fn non_empty<'a>(fields: &[&'a str], idx: usize, name: &'static str) -> Result<&'a str, RmcError> {
    fields.get(idx).copied().filter(|f| !f.is_empty()).ok_or(RmcError::Field(name))
}

fn two_digits(field: &str, at: usize, name: &'static str) -> Result<u32, RmcError> {
    field
        .get(at..at + 2)
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or(RmcError::Field(name))
}

/// `ddmm.mmmm` / `dddmm.mmmm` to decimal degrees, rounded to 6 places
fn coordinate(field: &str, degree_digits: usize, max: f64, name: &'static str) -> Result<f64, RmcError> {
    let degrees: f64 = field
        .get(..degree_digits)
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or(RmcError::Field(name))?;
    let minutes: f64 = field
        .get(degree_digits..)
        .and_then(|s| s.parse().ok())
        .filter(|m: &f64| (0.0..60.0).contains(m))
        .ok_or(RmcError::Field(name))?;

    let value = degrees + minutes / 60.0;
    if value > max {
        return Err(RmcError::Field(name));
    }
    Ok((value * 1e6).round() / 1e6)
}

fn signed(value: f64, hemisphere: &str, negative: &str, positive: &str, name: &'static str) -> Result<f64, RmcError> {
    if hemisphere == negative {
        Ok(-value)
    } else if hemisphere == positive {
        Ok(value)
    } else {
        Err(RmcError::Field(name))
    }
}

/// What one line from the receiver amounted to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineOutcome {
    /// Parsed and published
    Fix(PositionSample),
    /// RMC sentence without a usable fix
    Weak,
    /// Some other sentence or noise
    Ignored,
}

/// Why the read loop gave up on the current port
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Shutdown,
    Disconnected,
}

/// A port whose pending input can be thrown away
trait DiscardInput: AsyncRead + Unpin {
    fn discard_input(&self);
}

impl DiscardInput for SerialStream {
    fn discard_input(&self) {
        if let Err(e) = SerialPort::clear(self, ClearBuffer::Input) {
            debug!(error = %e, "gps_clear_input_failed");
        }
    }
}

/// Read one line of at most `MAX_SENTENCE_LEN` bytes into `buf`. A longer
/// line comes back without its trailing newline.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncRead + AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_SENTENCE_LEN as u64);
    limited.read_until(b'\n', buf).await
}

/// Reads the GPS receiver and publishes fixes
pub struct GpsFeed {
    device: Option<String>,
    usb_vid: String,
    baud: u32,
    retry_interval: Duration,
    ctx: Arc<JourneyContext>,
    observer: Arc<dyn JourneyObserver>,
    metrics: Arc<Metrics>,
}

impl GpsFeed {
    pub fn new(
        config: &Config,
        ctx: Arc<JourneyContext>,
        observer: Arc<dyn JourneyObserver>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            device: config.gps_device().map(str::to_string),
            usb_vid: config.gps_usb_vid().to_string(),
            baud: config.gps_baud(),
            retry_interval: Duration::from_millis(config.gps_retry_interval_ms()),
            ctx,
            observer,
            metrics,
        }
    }

    /// Configured device, or the first serial port whose USB vendor id matches
    fn resolve_device(&self) -> anyhow::Result<String> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let vid = u16::from_str_radix(&self.usb_vid, 16)
            .with_context(|| format!("invalid USB vendor id `{}`", self.usb_vid))?;
        let ports = tokio_serial::available_ports().context("failed to enumerate serial ports")?;
        ports
            .into_iter()
            .find_map(|port| match port.port_type {
                SerialPortType::UsbPort(info) if info.vid == vid => Some(port.port_name),
                _ => None,
            })
            .ok_or_else(|| anyhow!("no serial device with USB vendor id {}", self.usb_vid))
    }

    fn open_port(&self) -> anyhow::Result<(String, SerialStream)> {
        let device = self.resolve_device()?;
        let port = tokio_serial::new(&device, self.baud)
            .timeout(Duration::from_millis(500))
            .open_native_async()
            .with_context(|| format!("failed to open {device}"))?;
        Ok((device, port))
    }

    /// Handle one raw line from the receiver
    pub fn handle_line(&self, raw: &str) -> LineOutcome {
        if !is_rmc(raw) {
            trace!(line = %raw.trim(), "gps_sentence_ignored");
            return LineOutcome::Ignored;
        }

        match parse(raw) {
            Some(sample) => {
                self.publish(sample);
                LineOutcome::Fix(sample)
            }
            None => {
                self.metrics.record_weak_fix();
                self.observer.notify(JourneyNotice::WeakGps);
                LineOutcome::Weak
            }
        }
    }

    /// Push a fix into the position queue
    pub fn publish(&self, sample: PositionSample) {
        let overwritten = self.ctx.positions().push(sample);
        self.metrics.record_fix_published(overwritten);
        trace!(
            timestamp = %sample.timestamp_str(),
            lat = %sample.latitude,
            lon = %sample.longitude,
            overwritten = %overwritten,
            "gps_fix_published"
        );
    }

    /// Read lines until shutdown or an IO failure. The port is dropped on return.
    ///
    /// A weak fix pauses reading for `retry_interval`, then drops whatever
    /// queued up meanwhile so the next fix is a fresh one.
    async fn read_loop<P: DiscardInput>(&self, port: P, shutdown: &mut watch::Receiver<bool>) -> ReadOutcome {
        let mut reader = BufReader::new(port);
        let mut buf: Vec<u8> = Vec::with_capacity(128);
        let mut skipping = false;

        loop {
            buf.clear();
            let result = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return ReadOutcome::Shutdown,
                result = read_bounded_line(&mut reader, &mut buf) => result,
            };

            match result {
                Ok(0) => {
                    warn!("gps_port_eof");
                    return ReadOutcome::Disconnected;
                }
                Ok(_) => {
                    let complete = buf.last() == Some(&b'\n');
                    if skipping || !complete {
                        if !skipping {
                            debug!(len = buf.len(), "gps_line_too_long");
                        }
                        skipping = !complete;
                        continue;
                    }

                    let line = String::from_utf8_lossy(&buf);
                    if self.handle_line(&line) != LineOutcome::Weak {
                        continue;
                    }

                    debug!(retry_ms = %self.retry_interval.as_millis(), "gps_weak_signal_backoff");
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(shutdown) => return ReadOutcome::Shutdown,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                    let port = reader.into_inner();
                    port.discard_input();
                    reader = BufReader::new(port);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!(error = %e, "gps_read_error");
                    return ReadOutcome::Disconnected;
                }
            }
        }
    }

    /// Run the feed until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            device = ?self.device,
            usb_vid = %self.usb_vid,
            baud = %self.baud,
            retry_interval_ms = %self.retry_interval.as_millis(),
            "gps_feed_started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.open_port() {
                Ok((device, port)) => {
                    info!(device = %device, "gps_port_opened");
                    if self.read_loop(port, &mut shutdown).await == ReadOutcome::Shutdown {
                        break;
                    }
                    self.metrics.record_gps_reconnect();
                    warn!(
                        device = %device,
                        retry_ms = %self.retry_interval.as_millis(),
                        "gps_port_lost"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %format!("{e:#}"),
                        retry_ms = %self.retry_interval.as_millis(),
                        "gps_not_found"
                    );
                    self.observer.notify(JourneyNotice::NotFoundGps);
                }
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        info!("gps_feed_shutdown");
    }
}
