//! Scripted capture platform for tests and simulation
//!
//! Decodes are injected with `show()`; acquisition failures, delays and
//! capability checks are configurable at runtime. Acquire/release counters let
//! callers assert that the device is never leaked.

use crate::domain::errors::CameraError;
use crate::services::camera::{CaptureConstraints, CaptureDevice, CapturePlatform};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    failure: Mutex<Option<CameraError>>,
    acquire_delay: Mutex<Option<Duration>>,
    unsupported: AtomicBool,
    insecure: AtomicBool,
    feed: Mutex<Option<mpsc::UnboundedSender<String>>>,
    live: AtomicBool,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

/// Cloneable handle; every clone drives the same simulated camera
#[derive(Clone, Default)]
pub struct ScriptedCamera {
    inner: Arc<Inner>,
}

impl ScriptedCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every acquisition fail with `failure` until cleared
    pub fn set_failure(&self, failure: Option<CameraError>) {
        *self.inner.failure.lock() = failure;
    }

    /// Delay acquisitions, e.g. to exercise the acquire timeout
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        *self.inner.acquire_delay.lock() = delay;
    }

    pub fn set_unsupported(&self, unsupported: bool) {
        self.inner.unsupported.store(unsupported, Ordering::Relaxed);
    }

    pub fn set_insecure(&self, insecure: bool) {
        self.inner.insecure.store(insecure, Ordering::Relaxed);
    }

    /// Present a code to the live device. Returns false when no device is live.
    pub fn show(&self, payload: &str) -> bool {
        match self.inner.feed.lock().as_ref() {
            Some(feed) => feed.send(payload.to_string()).is_ok(),
            None => false,
        }
    }

    /// End the live device's stream, as if the camera were unplugged
    pub fn end_stream(&self) {
        self.inner.feed.lock().take();
    }

    /// True while a device is acquired and not yet released
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Relaxed)
    }

    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.inner.releases.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CapturePlatform for ScriptedCamera {
    fn supports_capture(&self) -> bool {
        !self.inner.unsupported.load(Ordering::Relaxed)
    }

    fn is_secure_context(&self) -> bool {
        !self.inner.insecure.load(Ordering::Relaxed)
    }

    async fn acquire(
        &self,
        target: &str,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let delay = *self.inner.acquire_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = *self.inner.failure.lock();
        if let Some(err) = failure {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.feed.lock() = Some(tx);
        self.inner.live.store(true, Ordering::Relaxed);
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!(surface = %target, max_fps = %constraints.max_fps, "scripted_camera_acquired");

        Ok(Box::new(ScriptedDevice { rx, inner: self.inner.clone(), released: false }))
    }
}

struct ScriptedDevice {
    rx: mpsc::UnboundedReceiver<String>,
    inner: Arc<Inner>,
    released: bool,
}

#[async_trait]
impl CaptureDevice for ScriptedDevice {
    async fn next_decode(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.rx.close();
        self.inner.feed.lock().take();
        self.inner.live.store(false, Ordering::Relaxed);
        self.inner.releases.fetch_add(1, Ordering::Relaxed);
    }
}
