//! Time-of-flight range sensors on serial ports
//!
//! Protocol (UART ToF module, one device per beam):
//! - Default 9600 baud, 8N1
//! - Query: ASCII `r6#`
//! - Response: one line, e.g. `L=812mm\r\n`. The `L=` prefix and `mm` suffix
//!   are optional; the distance is the run of decimal digits.
//!
//! Every failure surfaced by `SensorSource::read` is a per-tick condition: the
//! poll loop skips that sample and keeps going.

use crate::domain::types::{Distance, SensorId};
use crate::infra::config::Config;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

const QUERY: &[u8] = b"r6#";
const LINE_END: u8 = b'\n';
/// Longest line we accept before discarding the buffer
const MAX_LINE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {0} not connected")]
    Disconnected(SensorId),

    #[error("sensor {0} read timed out")]
    Timeout(SensorId),

    #[error("sensor {sensor} sent malformed response: {raw}")]
    Malformed { sensor: SensorId, raw: String },

    #[error("sensor io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplies one distance sample per beam on demand
#[async_trait]
pub trait SensorSource: Send {
    async fn read(&mut self, sensor: SensorId) -> Result<Distance, SensorError>;
}

/// Parse a response line into a distance.
///
/// Accepts `812`, `812mm`, `L=812mm` with optional surrounding whitespace.
pub fn parse_range_response(line: &[u8]) -> Option<Distance> {
    let text = std::str::from_utf8(line).ok()?.trim();
    let text = text.strip_prefix("L=").unwrap_or(text);
    let text = text.strip_suffix("mm").unwrap_or(text).trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok().map(Distance)
}

/// Drop leading bytes that cannot start a response
fn synchronize_buffer(sensor: SensorId, buffer: &mut Vec<u8>) {
    match buffer.iter().position(|&b| b == b'L' || b.is_ascii_digit()) {
        Some(0) => {}
        Some(start_idx) => {
            debug!(sensor = %sensor, discarded = start_idx, "sensor_sync_discarded_bytes");
            buffer.drain(..start_idx);
        }
        None if !buffer.is_empty() => {
            debug!(sensor = %sensor, discarded = buffer.len(), "sensor_sync_no_start_byte");
            buffer.clear();
        }
        None => {}
    }
}

/// Take one complete line out of the buffer, if present
fn take_line(sensor: SensorId, buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.iter().position(|&b| b == LINE_END)?;
    let line: Vec<u8> = buffer.drain(..=end).collect();
    if !buffer.is_empty() {
        tracing::trace!(sensor = %sensor, leftover = buffer.len(), "sensor_frame_leftover_bytes");
    }
    Some(line)
}

/// Serial port for one beam, with a persistent line buffer
struct SensorPort {
    sensor: SensorId,
    device: String,
    port: Option<tokio_serial::SerialStream>,
    last_open_attempt: Option<Instant>,
    /// Bytes carried across reads; responses can arrive split over chunks
    read_buffer: Vec<u8>,
}

impl SensorPort {
    fn new(sensor: SensorId, device: &str) -> Self {
        Self {
            sensor,
            device: device.to_string(),
            port: None,
            last_open_attempt: None,
            read_buffer: Vec::with_capacity(MAX_LINE_LEN),
        }
    }

    fn ensure_open(&mut self, baud: u32, reopen_interval: Duration) -> Result<(), SensorError> {
        if self.port.is_some() {
            return Ok(());
        }
        if let Some(last) = self.last_open_attempt {
            if last.elapsed() < reopen_interval {
                return Err(SensorError::Disconnected(self.sensor));
            }
        }
        self.last_open_attempt = Some(Instant::now());

        match tokio_serial::new(&self.device, baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
        {
            Ok(port) => {
                info!(sensor = %self.sensor, device = %self.device, "sensor_port_opened");
                self.read_buffer.clear();
                self.port = Some(port);
                Ok(())
            }
            Err(e) => {
                warn!(
                    sensor = %self.sensor,
                    device = %self.device,
                    error = %e,
                    "sensor_port_open_failed"
                );
                Err(SensorError::Disconnected(self.sensor))
            }
        }
    }

    async fn query(&mut self, read_timeout: Duration) -> Result<Distance, SensorError> {
        let SensorPort { sensor, port, read_buffer, .. } = self;
        let sensor = *sensor;
        let Some(port) = port.as_mut() else {
            return Err(SensorError::Disconnected(sensor));
        };

        // Stale bytes from an earlier timed-out query would pair with this one
        read_buffer.clear();
        port.write_all(QUERY).await?;

        let deadline = tokio::time::Instant::now() + read_timeout;
        let mut temp_buf = [0u8; 32];
        loop {
            if let Some(line) = take_line(sensor, read_buffer) {
                return parse_range_response(&line).ok_or_else(|| SensorError::Malformed {
                    sensor,
                    raw: String::from_utf8_lossy(&line).trim().to_string(),
                });
            }

            let n = match tokio::time::timeout_at(deadline, port.read(&mut temp_buf)).await {
                Ok(Ok(0)) => {
                    return Err(SensorError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Ok(Err(e)) => return Err(SensorError::Io(e)),
                Err(_) => return Err(SensorError::Timeout(sensor)),
            };

            read_buffer.extend_from_slice(&temp_buf[..n]);
            synchronize_buffer(sensor, read_buffer);
            if read_buffer.len() > MAX_LINE_LEN && !read_buffer.contains(&LINE_END) {
                let raw = String::from_utf8_lossy(read_buffer).to_string();
                read_buffer.clear();
                return Err(SensorError::Malformed { sensor, raw });
            }
        }
    }
}

/// Both beams, each on its own serial device
pub struct SerialRangeSource {
    ports: [SensorPort; 2],
    baud: u32,
    read_timeout: Duration,
    reopen_interval: Duration,
}

impl SerialRangeSource {
    pub fn new(config: &Config) -> Self {
        let devices = config.sensor_devices();
        Self {
            ports: SensorId::ALL.map(|sensor| SensorPort::new(sensor, &devices[sensor.index()])),
            baud: config.sensor_baud(),
            read_timeout: config.sensor_read_timeout(),
            reopen_interval: config.sensor_reopen_interval(),
        }
    }

    pub fn device(&self, sensor: SensorId) -> &str {
        &self.ports[sensor.index()].device
    }
}

#[async_trait]
impl SensorSource for SerialRangeSource {
    async fn read(&mut self, sensor: SensorId) -> Result<Distance, SensorError> {
        let (baud, reopen_interval, read_timeout) =
            (self.baud, self.reopen_interval, self.read_timeout);
        let port = &mut self.ports[sensor.index()];
        port.ensure_open(baud, reopen_interval)?;

        match port.query(read_timeout).await {
            Ok(distance) => Ok(distance),
            Err(SensorError::Io(e)) => {
                // Device unplugged or port broken: drop it and reopen later
                warn!(sensor = %sensor, device = %port.device, error = %e, "sensor_port_closed");
                port.port = None;
                Err(SensorError::Io(e))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_response_formats() {
        assert_eq!(parse_range_response(b"L=812mm\r\n"), Some(Distance(812)));
        assert_eq!(parse_range_response(b"812mm\n"), Some(Distance(812)));
        assert_eq!(parse_range_response(b"  45\r\n"), Some(Distance(45)));
        assert_eq!(parse_range_response(b"L=0mm\n"), Some(Distance(0)));
    }

    #[test]
    fn test_parse_range_response_rejects_garbage() {
        assert_eq!(parse_range_response(b"\r\n"), None);
        assert_eq!(parse_range_response(b"L=mm\n"), None);
        assert_eq!(parse_range_response(b"L=-5mm\n"), None);
        assert_eq!(parse_range_response(b"L=81x2mm\n"), None);
        assert_eq!(parse_range_response(&[0xFF, 0xFE, b'\n']), None);
    }

    #[test]
    fn test_synchronize_and_take_line() {
        let mut buffer = b"\x00\x13L=700mm\r\n5".to_vec();
        synchronize_buffer(SensorId::Outside, &mut buffer);
        assert_eq!(buffer[0], b'L');

        let line = take_line(SensorId::Outside, &mut buffer).unwrap();
        assert_eq!(parse_range_response(&line), Some(Distance(700)));
        assert_eq!(buffer, b"5");
        assert!(take_line(SensorId::Outside, &mut buffer).is_none());
    }

    #[test]
    fn test_synchronize_clears_noise() {
        let mut buffer = b"\r\n\x00".to_vec();
        synchronize_buffer(SensorId::Inside, &mut buffer);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_error_messages_name_the_sensor() {
        assert_eq!(SensorError::Timeout(SensorId::Outside).to_string(), "sensor outside read timed out");
        assert_eq!(SensorError::Disconnected(SensorId::Inside).to_string(), "sensor inside not connected");
    }

    #[tokio::test]
    async fn test_missing_device_reports_disconnected() {
        let mut source = SerialRangeSource::new(&Config::default());
        source.ports[0].device = "/dev/does-not-exist-door-counter".to_string();

        let err = source.read(SensorId::Outside).await.unwrap_err();
        assert!(matches!(err, SensorError::Disconnected(SensorId::Outside)));

        // Reopen is throttled; the next read fails fast without retrying open
        let first_attempt = source.ports[0].last_open_attempt;
        let err = source.read(SensorId::Outside).await.unwrap_err();
        assert!(matches!(err, SensorError::Disconnected(SensorId::Outside)));
        assert_eq!(source.ports[0].last_open_attempt, first_attempt);
    }
}
