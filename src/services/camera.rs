//! Camera session manager - owns the lifetime of a single capture device
//!
//! The manager acquires a device through a `CapturePlatform`, then spawns a
//! frame pump that pulls decodes at a bounded rate and pushes them into a
//! bounded channel. The device is released when the pump task ends, which
//! happens on `close()`, on drop of the manager, or when the stream ends.
//!
//! A successful `open()` hands out a `CameraLease`. Only the matching lease
//! can take the code stream or close the device, so a caller whose open was
//! rejected as busy cannot tear down the holder.

use crate::domain::errors::CameraError;
use crate::domain::types::DecodedCode;
use crate::infra::config::{Config, Facing};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Requested capture parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConstraints {
    pub facing: Facing,
    pub max_fps: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self { facing: Facing::Rear, max_fps: 8 }
    }
}

/// Platform capture API
#[async_trait]
pub trait CapturePlatform: Send + Sync {
    /// Whether the runtime has any capture capability at all
    fn supports_capture(&self) -> bool;

    /// Whether the engine runs in a secure (HTTPS or local) origin
    fn is_secure_context(&self) -> bool;

    /// Acquire a device rendering to `target`
    async fn acquire(
        &self,
        target: &str,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// An acquired capture device yielding decoded payloads
#[async_trait]
pub trait CaptureDevice: Send {
    /// Next decoded payload, or `None` once the stream has ended
    async fn next_decode(&mut self) -> Option<String>;

    /// Release the underlying hardware. Must be idempotent.
    fn release(&mut self);
}

/// Releases the device when dropped, whichever way the pump exits
struct DeviceGuard {
    device: Box<dyn CaptureDevice>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.device.release();
        debug!("camera_device_released");
    }
}

/// Proof of a successful `open()`; required to read from or close the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraLease {
    epoch: u64,
}

struct Held {
    epoch: u64,
    pump: JoinHandle<()>,
    codes: Option<mpsc::Receiver<DecodedCode>>,
}

enum Slot {
    Free,
    /// An open is in flight; tagged so a stale open cannot overwrite a newer state
    Opening(u64),
    Held(Held),
}

/// Reverts `Opening` to `Free` if the open future fails or is dropped
struct OpeningGuard<'a> {
    slot: &'a Mutex<Slot>,
    epoch: u64,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Opening(epoch) if epoch == self.epoch) {
            *slot = Slot::Free;
        }
    }
}

pub struct CameraSessionManager {
    platform: Arc<dyn CapturePlatform>,
    constraints: CaptureConstraints,
    acquire_timeout: Duration,
    buffer: usize,
    metrics: Arc<Metrics>,
    slot: Mutex<Slot>,
    next_epoch: AtomicU64,
}

impl CameraSessionManager {
    pub fn new(
        platform: Arc<dyn CapturePlatform>,
        constraints: CaptureConstraints,
        acquire_timeout: Duration,
        buffer: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            platform,
            constraints,
            acquire_timeout,
            buffer: buffer.max(1),
            metrics,
            slot: Mutex::new(Slot::Free),
            next_epoch: AtomicU64::new(1),
        }
    }

    pub fn from_config(
        platform: Arc<dyn CapturePlatform>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let constraints =
            CaptureConstraints { facing: config.facing(), max_fps: config.max_fps() };
        Self::new(platform, constraints, config.acquire_timeout(), config.camera_buffer(), metrics)
    }

    /// Acquire the capture device and start the frame pump.
    ///
    /// Fails fast with `DeviceBusy` when a device is already held or another
    /// open is in flight.
    pub async fn open(&self, target: &str) -> Result<CameraLease, CameraError> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Free) {
                warn!(surface = %target, "camera_open_rejected_busy");
                return Err(CameraError::DeviceBusy);
            }
            *slot = Slot::Opening(epoch);
        }
        let _opening = OpeningGuard { slot: &self.slot, epoch };

        if !self.platform.supports_capture() {
            return Err(CameraError::Unsupported);
        }
        if !self.platform.is_secure_context() {
            return Err(CameraError::InsecureContext);
        }

        let device =
            match timeout(self.acquire_timeout, self.platform.acquire(target, &self.constraints))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        surface = %target,
                        timeout_ms = %self.acquire_timeout.as_millis(),
                        "camera_acquire_timeout"
                    );
                    return Err(CameraError::DeviceBusy);
                }
            };
        let guard = DeviceGuard { device };

        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Opening(current) if current == epoch) {
            // Closed while acquiring; the guard releases the device here
            drop(guard);
            debug!(surface = %target, "camera_open_superseded");
            return Err(CameraError::DeviceBusy);
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let pump = tokio::spawn(pump_decodes(
            guard,
            tx,
            self.constraints.max_fps,
            self.metrics.clone(),
        ));
        *slot = Slot::Held(Held { epoch, pump, codes: Some(rx) });

        info!(
            surface = %target,
            epoch = %epoch,
            max_fps = %self.constraints.max_fps,
            facing = ?self.constraints.facing,
            "camera_opened"
        );
        Ok(CameraLease { epoch })
    }

    /// Take the decoded-code stream of the open device. Available once per open.
    pub fn decoded_codes(&self, lease: CameraLease) -> Option<mpsc::Receiver<DecodedCode>> {
        match &mut *self.slot.lock() {
            Slot::Held(held) if held.epoch == lease.epoch => held.codes.take(),
            _ => None,
        }
    }

    /// Stop the frame pump and release the device held under `lease`.
    ///
    /// A lease that no longer matches the holder (closed already, or a later
    /// open has taken the slot) is a no-op.
    pub async fn close(&self, lease: CameraLease) {
        let held = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Free) {
                Slot::Held(held) if held.epoch == lease.epoch => held,
                other => {
                    let free = matches!(other, Slot::Free);
                    *slot = other;
                    if free {
                        trace!(epoch = %lease.epoch, "camera_close_noop");
                    } else {
                        debug!(epoch = %lease.epoch, "camera_close_not_holder");
                    }
                    return;
                }
            }
        };

        held.pump.abort();
        // Wait for the pump to drop its device guard
        let _ = held.pump.await;
        info!(epoch = %lease.epoch, "camera_closed");
    }

    /// Whether a device is held and its pump is still delivering
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Held(held) if !held.pump.is_finished())
    }
}

impl Drop for CameraSessionManager {
    fn drop(&mut self) {
        if let Slot::Held(held) = std::mem::replace(self.slot.get_mut(), Slot::Free) {
            held.pump.abort();
        }
    }
}

/// Pull decodes from the device at no more than `max_fps` per second
async fn pump_decodes(
    mut guard: DeviceGuard,
    tx: mpsc::Sender<DecodedCode>,
    max_fps: u32,
    metrics: Arc<Metrics>,
) {
    let mut ticker = interval(Duration::from_secs_f64(1.0 / f64::from(max_fps.max(1))));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(raw) = guard.device.next_decode().await else {
            info!("camera_stream_ended");
            break;
        };

        let payload = raw.trim();
        if payload.is_empty() {
            continue;
        }
        metrics.record_decode();

        match tx.try_send(DecodedCode::new(payload)) {
            Ok(()) => trace!(len = %payload.len(), "camera_decode"),
            Err(TrySendError::Full(_)) => {
                metrics.record_decode_dropped();
                debug!("camera_decode_dropped_buffer_full");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    // Release before the receiver observes the end of the stream
    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::scripted_camera::ScriptedCamera;

    fn manager(camera: &ScriptedCamera) -> CameraSessionManager {
        CameraSessionManager::new(
            Arc::new(camera.clone()),
            CaptureConstraints { facing: Facing::Rear, max_fps: 1000 },
            Duration::from_millis(200),
            8,
            Arc::new(Metrics::new()),
        )
    }

    async fn wait_closed(mgr: &CameraSessionManager) {
        for _ in 0..50 {
            if !mgr.is_open() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_open_delivers_trimmed_codes() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);

        let lease = mgr.open("gate").await.unwrap();
        assert!(mgr.is_open());
        let mut codes = mgr.decoded_codes(lease).unwrap();
        assert!(mgr.decoded_codes(lease).is_none());

        assert!(camera.show("   "));
        assert!(camera.show("  PLKTK000001\n"));
        let code = codes.recv().await.unwrap();
        assert_eq!(code.payload, "PLKTK000001");

        mgr.close(lease).await;
        assert!(!mgr.is_open());
        assert!(!camera.is_live());
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn test_second_open_fails_busy() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);

        let lease = mgr.open("gate").await.unwrap();
        assert_eq!(mgr.open("gate").await, Err(CameraError::DeviceBusy));
        assert_eq!(camera.acquisitions(), 1);
        assert!(mgr.is_open());
        mgr.close(lease).await;
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_close_new_holder() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);

        let first = mgr.open("gate").await.unwrap();
        mgr.close(first).await;
        let second = mgr.open("gate").await.unwrap();
        assert_ne!(first, second);

        mgr.close(first).await;
        assert!(mgr.is_open());
        assert!(camera.is_live());
        assert!(mgr.decoded_codes(first).is_none());
        assert!(mgr.decoded_codes(second).is_some());

        mgr.close(second).await;
        assert!(!camera.is_live());
        assert_eq!(camera.releases(), 2);
    }

    #[tokio::test]
    async fn test_capability_checks_run_in_order() {
        let camera = ScriptedCamera::new();
        camera.set_unsupported(true);
        camera.set_insecure(true);
        let mgr = manager(&camera);

        assert_eq!(mgr.open("gate").await, Err(CameraError::Unsupported));
        camera.set_unsupported(false);
        assert_eq!(mgr.open("gate").await, Err(CameraError::InsecureContext));
        assert!(!mgr.is_open());
        assert_eq!(camera.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_slot_free() {
        let camera = ScriptedCamera::new();
        camera.set_failure(Some(CameraError::PermissionDenied));
        let mgr = manager(&camera);

        assert_eq!(mgr.open("gate").await, Err(CameraError::PermissionDenied));
        assert!(!mgr.is_open());

        camera.set_failure(None);
        let lease = mgr.open("gate").await.unwrap();
        assert!(mgr.is_open());
        mgr.close(lease).await;
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_device_busy() {
        let camera = ScriptedCamera::new();
        camera.set_acquire_delay(Some(Duration::from_secs(5)));
        let mgr = manager(&camera);

        assert_eq!(mgr.open("gate").await, Err(CameraError::DeviceBusy));
        assert!(!mgr.is_open());
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);

        let lease = mgr.open("gate").await.unwrap();
        mgr.close(lease).await;
        mgr.close(lease).await;
        assert_eq!(camera.releases(), 1);
    }

    #[tokio::test]
    async fn test_stream_end_closes_sequence_and_releases() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);

        let lease = mgr.open("gate").await.unwrap();
        let mut codes = mgr.decoded_codes(lease).unwrap();
        camera.end_stream();

        assert!(codes.recv().await.is_none());
        assert!(!camera.is_live());
        wait_closed(&mgr).await;
        assert!(!mgr.is_open());
        mgr.close(lease).await;
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let camera = ScriptedCamera::new();
        let mgr = manager(&camera);
        mgr.open("gate").await.unwrap();
        drop(mgr);

        // Aborted pump drops its guard on the next scheduler pass
        for _ in 0..50 {
            if !camera.is_live() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!camera.is_live());
    }
}
