//! Serial barcode scanner capture platform
//!
//! Handheld and fixed-mount scanners in serial (or USB-CDC) mode emit each
//! decoded symbol as an ASCII line terminated by CR, LF or CRLF.
//! - Baud: configurable, 9600 by default, 8N1
//! - Frame: payload bytes followed by `\r` and/or `\n`

use crate::domain::errors::CameraError;
use crate::services::camera::{CaptureConstraints, CaptureDevice, CapturePlatform};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// Longest line kept while waiting for a terminator
const MAX_LINE_LEN: usize = 4096;

/// Per-read timeout so release is observed promptly
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialScanner {
    device: String,
    baud: u32,
    secure: bool,
}

impl SerialScanner {
    pub fn new(device: &str, baud: u32, secure: bool) -> Self {
        Self { device: device.to_string(), baud, secure }
    }
}

fn map_open_error(e: &tokio_serial::Error) -> CameraError {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => CameraError::Unsupported,
        tokio_serial::ErrorKind::Io(ErrorKind::NotFound) => CameraError::Unsupported,
        tokio_serial::ErrorKind::Io(ErrorKind::PermissionDenied) => CameraError::PermissionDenied,
        _ => CameraError::DeviceBusy,
    }
}

#[async_trait]
impl CapturePlatform for SerialScanner {
    fn supports_capture(&self) -> bool {
        Path::new(&self.device).exists()
    }

    fn is_secure_context(&self) -> bool {
        self.secure
    }

    async fn acquire(
        &self,
        target: &str,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(READ_TIMEOUT)
            .open_native_async()
            .map_err(|e| {
                warn!(device = %self.device, error = %e, "serial_scanner_open_failed");
                map_open_error(&e)
            })?;

        info!(
            device = %self.device,
            baud = %self.baud,
            surface = %target,
            max_fps = %constraints.max_fps,
            "serial_scanner_opened"
        );
        Ok(Box::new(SerialDevice { port: Some(port), lines: LineBuffer::default() }))
    }
}

/// Accumulates bytes across reads and yields complete lines.
/// Scanners may deliver one symbol over several reads, so partial
/// data is kept for the next read.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_LINE_LEN && !self.buf.iter().any(|b| matches!(b, b'\r' | b'\n')) {
            debug!(discarded = self.buf.len(), "serial_scanner_line_overflow");
            self.buf.clear();
        }
    }

    /// Next non-empty UTF-8 line, if a terminator has arrived
    fn next_line(&mut self) -> Option<String> {
        while let Some(end) = self.buf.iter().position(|b| matches!(b, b'\r' | b'\n')) {
            let line: Vec<u8> = self.buf.drain(..=end).take(end).collect();
            if line.is_empty() {
                continue;
            }
            match String::from_utf8(line) {
                Ok(text) => return Some(text),
                Err(e) => {
                    warn!(raw_bytes = %hex::encode(e.as_bytes()), "serial_scanner_non_utf8_line");
                }
            }
        }
        None
    }
}

struct SerialDevice {
    port: Option<tokio_serial::SerialStream>,
    lines: LineBuffer,
}

#[async_trait]
impl CaptureDevice for SerialDevice {
    async fn next_decode(&mut self) -> Option<String> {
        let mut temp_buf = [0u8; 256];
        loop {
            if let Some(line) = self.lines.next_line() {
                return Some(line);
            }
            let port = self.port.as_mut()?;
            match tokio::time::timeout(READ_TIMEOUT, port.read(&mut temp_buf)).await {
                Ok(Ok(0)) => {
                    info!("serial_scanner_eof");
                    return None;
                }
                Ok(Ok(n)) => self.lines.push(&temp_buf[..n]),
                Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "serial_scanner_read_error");
                    return None;
                }
                Err(_) => {}
            }
        }
    }

    fn release(&mut self) {
        if self.port.take().is_some() {
            info!("serial_scanner_released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_on_any_terminator() {
        let mut lines = LineBuffer::default();
        lines.push(b"PLKTK000001\r\nPLKTK000002\nPLKT");
        assert_eq!(lines.next_line().as_deref(), Some("PLKTK000001"));
        assert_eq!(lines.next_line().as_deref(), Some("PLKTK000002"));
        assert_eq!(lines.next_line(), None);

        lines.push(b"K000003\r");
        assert_eq!(lines.next_line().as_deref(), Some("PLKTK000003"));
    }

    #[test]
    fn test_non_utf8_line_is_skipped() {
        let mut lines = LineBuffer::default();
        lines.push(&[0xff, 0xfe, b'\n']);
        lines.push(b"OK\n");
        assert_eq!(lines.next_line().as_deref(), Some("OK"));
    }

    #[test]
    fn test_unterminated_overflow_is_discarded() {
        let mut lines = LineBuffer::default();
        lines.push(&vec![b'A'; MAX_LINE_LEN + 1]);
        lines.push(b"B\n");
        assert_eq!(lines.next_line().as_deref(), Some("B"));
    }

    #[test]
    fn test_missing_device_is_unsupported() {
        let scanner = SerialScanner::new("/dev/does-not-exist-scanner", 9600, true);
        assert!(!scanner.supports_capture());
        assert!(scanner.is_secure_context());
    }
}
