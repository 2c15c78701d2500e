//! Keyboard-wedge capture platform
//!
//! USB scanners in HID mode type each decoded symbol followed by Enter, so
//! stdin lines are decodes. Also handy for manual entry during testing.

use crate::domain::errors::CameraError;
use crate::services::camera::{CaptureConstraints, CaptureDevice, CapturePlatform};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

pub struct KeyboardScanner {
    secure: bool,
}

impl KeyboardScanner {
    pub fn new(secure: bool) -> Self {
        Self { secure }
    }
}

#[async_trait]
impl CapturePlatform for KeyboardScanner {
    fn supports_capture(&self) -> bool {
        true
    }

    fn is_secure_context(&self) -> bool {
        self.secure
    }

    async fn acquire(
        &self,
        target: &str,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        info!(surface = %target, "keyboard_scanner_opened");
        let lines = BufReader::new(tokio::io::stdin()).lines();
        Ok(Box::new(KeyboardDevice { lines: Some(lines) }))
    }
}

struct KeyboardDevice {
    lines: Option<Lines<BufReader<Stdin>>>,
}

#[async_trait]
impl CaptureDevice for KeyboardDevice {
    async fn next_decode(&mut self) -> Option<String> {
        let lines = self.lines.as_mut()?;
        match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "keyboard_scanner_read_error");
                None
            }
        }
    }

    fn release(&mut self) {
        if self.lines.take().is_some() {
            info!("keyboard_scanner_released");
        }
    }
}
