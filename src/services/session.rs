//! Scan session state machine
//!
//! A single driver task owns the session state. Camera acquisition and every
//! resolution run are spawned tasks whose results come back through the
//! driver's select loop, so the driver never blocks on I/O. Callers interact
//! through a cloneable `ScanSessionHandle`: commands go in over mpsc, state
//! comes out through a watch channel and Decided events through broadcast.
//!
//! ```text
//! Idle -> Initializing -> Scanning -> Resolving -> Decided(..) -> Scanning
//!                     \-> Decided(Error(Camera)) -- rearm --> Initializing
//! any state -> Closed
//! ```

use crate::domain::errors::{CameraError, RecoveryAction, ResolutionError, ScanError};
use crate::domain::ticket::TicketDetails;
use crate::domain::types::{CheckInOutcome, DecodedCode, OperatorId, SessionId};
use crate::infra::config::Config;
use crate::infra::metrics::{
    Metrics, SESSION_STATE_CLOSED, SESSION_STATE_DECIDED, SESSION_STATE_IDLE,
    SESSION_STATE_INITIALIZING, SESSION_STATE_RESOLVING, SESSION_STATE_SCANNING,
};
use crate::services::camera::{CameraLease, CameraSessionManager};
use crate::services::debouncer::ScanDebouncer;
use crate::services::resolver::{Resolution, ResolutionPipeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the Decided broadcast; slow subscribers see `Lagged`
const DECIDED_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "error", rename_all = "snake_case")]
pub enum Decision {
    Success,
    AlreadyDone,
    Error(ScanError),
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Success => "success",
            Decision::AlreadyDone => "already_done",
            Decision::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Initializing,
    Scanning,
    Resolving,
    Decided(Decision),
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Scanning => "scanning",
            SessionState::Resolving => "resolving",
            SessionState::Decided(_) => "decided",
            SessionState::Closed => "closed",
        }
    }

    fn gauge(&self) -> u64 {
        match self {
            SessionState::Idle => SESSION_STATE_IDLE,
            SessionState::Initializing => SESSION_STATE_INITIALIZING,
            SessionState::Scanning => SESSION_STATE_SCANNING,
            SessionState::Resolving => SESSION_STATE_RESOLVING,
            SessionState::Decided(_) => SESSION_STATE_DECIDED,
            SessionState::Closed => SESSION_STATE_CLOSED,
        }
    }

    #[inline]
    fn is_camera_error(&self) -> bool {
        matches!(self, SessionState::Decided(Decision::Error(e)) if e.is_camera())
    }
}

/// One per resolution attempt (or camera failure)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecidedEvent {
    pub session_id: SessionId,
    /// Resolution attempt this decision belongs to (0 for camera failures before any scan)
    pub attempt: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<TicketDetails>,
    pub message: String,
    pub recovery: RecoveryAction,
    pub decided_at: DateTime<Utc>,
}

/// What the UI renders
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub last_decided: Option<DecidedEvent>,
    pub last_error: Option<ScanError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("scan session is closed")]
pub struct SessionClosed;

#[derive(Debug)]
enum SessionCommand {
    Open,
    Rearm,
    Close { ack: oneshot::Sender<()> },
}

/// Static session parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub operator: OperatorId,
    /// Surface the camera renders into
    pub target: String,
    pub error_cooldown: Duration,
    pub success_rearm: Option<Duration>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            operator: OperatorId::new(config.operator_id()),
            target: config.site_id().to_string(),
            error_cooldown: config.error_cooldown(),
            success_rearm: config.success_rearm(),
        }
    }
}

/// Cloneable control surface of a running session
#[derive(Clone)]
pub struct ScanSessionHandle {
    session_id: SessionId,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionSnapshot>,
    decided_tx: broadcast::Sender<DecidedEvent>,
}

impl ScanSessionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Start the camera (Idle) or retry it after a camera error
    pub async fn open(&self) -> Result<(), SessionClosed> {
        self.cmd_tx.send(SessionCommand::Open).await.map_err(|_| SessionClosed)
    }

    /// Return to Scanning after a decision
    pub async fn rearm(&self) -> Result<(), SessionClosed> {
        self.cmd_tx.send(SessionCommand::Rearm).await.map_err(|_| SessionClosed)
    }

    /// Close the session and wait until the camera is released. Idempotent.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Close { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().state.clone()
    }

    /// Watch the full snapshot
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    /// Subscribe to Decided events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DecidedEvent> {
        self.decided_tx.subscribe()
    }

    /// Wait until the state satisfies `pred`
    pub async fn wait_for_state(
        &self,
        mut pred: impl FnMut(&SessionState) -> bool,
    ) -> Result<SessionState, SessionClosed> {
        let mut rx = self.state_rx.clone();
        let snapshot = rx.wait_for(|s| pred(&s.state)).await.map_err(|_| SessionClosed)?;
        Ok(snapshot.state.clone())
    }
}

struct InFlight {
    attempt: u64,
    code: String,
    handle: JoinHandle<Result<Resolution, ResolutionError>>,
}

enum Event {
    Command(Option<SessionCommand>),
    Opened(Result<Result<CameraLease, CameraError>, JoinError>),
    Decoded(Option<DecodedCode>),
    Resolved(u64, Result<Result<Resolution, ResolutionError>, JoinError>),
    RearmDue,
}

/// Session driver; spawn `run()` on the runtime
pub struct ScanSession {
    id: SessionId,
    camera: Arc<CameraSessionManager>,
    pipeline: Arc<ResolutionPipeline>,
    settings: SessionSettings,
    metrics: Arc<Metrics>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<SessionSnapshot>,
    decided_tx: broadcast::Sender<DecidedEvent>,
    debouncer: ScanDebouncer,
    state: SessionState,
    attempt: u64,
    opening: Option<JoinHandle<Result<CameraLease, CameraError>>>,
    /// Held only while this session owns the camera
    lease: Option<CameraLease>,
    codes: Option<mpsc::Receiver<DecodedCode>>,
    in_flight: Option<InFlight>,
    rearm_at: Option<Instant>,
    last_decided: Option<DecidedEvent>,
    last_error: Option<ScanError>,
}

/// Create a scan session
///
/// Returns the handle (for the UI) and the driver (to be spawned)
pub fn create_scan_session(
    camera: Arc<CameraSessionManager>,
    pipeline: Arc<ResolutionPipeline>,
    settings: SessionSettings,
    metrics: Arc<Metrics>,
) -> (ScanSessionHandle, ScanSession) {
    let id = SessionId::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(SessionSnapshot {
        session_id: id,
        state: SessionState::Idle,
        last_decided: None,
        last_error: None,
    });
    let (decided_tx, _) = broadcast::channel(DECIDED_CHANNEL_CAPACITY);

    let handle =
        ScanSessionHandle { session_id: id, cmd_tx, state_rx, decided_tx: decided_tx.clone() };
    let session = ScanSession {
        id,
        camera,
        pipeline,
        settings,
        metrics,
        cmd_rx,
        state_tx,
        decided_tx,
        debouncer: ScanDebouncer::new(),
        state: SessionState::Idle,
        attempt: 0,
        opening: None,
        lease: None,
        codes: None,
        in_flight: None,
        rearm_at: None,
        last_decided: None,
        last_error: None,
    };
    (handle, session)
}

async fn join_opening(
    opening: &mut Option<JoinHandle<Result<CameraLease, CameraError>>>,
) -> Result<Result<CameraLease, CameraError>, JoinError> {
    match opening {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn next_code(codes: &mut Option<mpsc::Receiver<DecodedCode>>) -> Option<DecodedCode> {
    match codes {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn join_resolution(
    in_flight: &mut Option<InFlight>,
) -> (u64, Result<Result<Resolution, ResolutionError>, JoinError>) {
    match in_flight {
        Some(flight) => (flight.attempt, (&mut flight.handle).await),
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

impl ScanSession {
    /// Run the session until it is closed or every handle is dropped
    pub async fn run(mut self) {
        info!(session_id = %self.id, operator = %self.settings.operator, "scan_session_started");

        loop {
            let event = tokio::select! {
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                res = join_opening(&mut self.opening), if self.opening.is_some() => Event::Opened(res),
                code = next_code(&mut self.codes), if self.codes.is_some() => Event::Decoded(code),
                (attempt, res) = join_resolution(&mut self.in_flight), if self.in_flight.is_some() => {
                    Event::Resolved(attempt, res)
                }
                _ = sleep_opt(self.rearm_at), if self.rearm_at.is_some() => Event::RearmDue,
            };

            match event {
                Event::Command(Some(SessionCommand::Open)) => self.on_open(),
                Event::Command(Some(SessionCommand::Rearm)) => self.on_rearm("operator"),
                Event::Command(Some(SessionCommand::Close { ack })) => {
                    self.shutdown().await;
                    let _ = ack.send(());
                    break;
                }
                Event::Command(None) => {
                    debug!(session_id = %self.id, "scan_session_handles_dropped");
                    self.shutdown().await;
                    break;
                }
                Event::Opened(result) => {
                    self.opening = None;
                    self.on_opened(result).await;
                }
                Event::Decoded(Some(code)) => self.on_decoded(code),
                Event::Decoded(None) => self.on_stream_ended().await,
                Event::Resolved(attempt, result) => self.on_resolved(attempt, result),
                Event::RearmDue => {
                    self.rearm_at = None;
                    self.on_rearm("timer");
                }
            }
        }

        info!(session_id = %self.id, attempts = %self.attempt, "scan_session_closed");
    }

    fn on_open(&mut self) {
        match &self.state {
            SessionState::Idle => self.begin_open(),
            state if state.is_camera_error() => self.begin_open(),
            state => {
                debug!(session_id = %self.id, state = %state.as_str(), "open_ignored");
            }
        }
    }

    fn on_rearm(&mut self, trigger: &'static str) {
        match &self.state {
            state if state.is_camera_error() => {
                // Retry action for camera errors
                if trigger == "operator" {
                    self.begin_open();
                }
            }
            SessionState::Decided(_) => {
                if self.codes.is_none() {
                    // Camera was lost while resolving
                    self.begin_open();
                    return;
                }
                self.rearm_at = None;
                self.debouncer.rearm();
                info!(session_id = %self.id, trigger = %trigger, "scanner_rearmed");
                self.set_state(SessionState::Scanning);
            }
            state => {
                debug!(session_id = %self.id, state = %state.as_str(), "rearm_ignored");
            }
        }
    }

    fn begin_open(&mut self) {
        self.rearm_at = None;
        self.debouncer.rearm();
        self.set_state(SessionState::Initializing);

        let camera = self.camera.clone();
        let target = self.settings.target.clone();
        self.opening = Some(tokio::spawn(async move { camera.open(&target).await }));
    }

    async fn on_opened(&mut self, result: Result<Result<CameraLease, CameraError>, JoinError>) {
        let camera_result = match result {
            Ok(Ok(lease)) => {
                self.lease = Some(lease);
                self.camera.decoded_codes(lease).ok_or(CameraError::StreamEnded)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!(session_id = %self.id, error = %e, "camera_open_task_failed");
                Err(CameraError::DeviceBusy)
            }
        };

        match camera_result {
            Ok(rx) => {
                self.codes = Some(rx);
                self.metrics.record_camera_open();
                self.set_state(SessionState::Scanning);
            }
            Err(e) => self.camera_failed(e).await,
        }
    }

    fn on_decoded(&mut self, code: DecodedCode) {
        if self.state != SessionState::Scanning || !self.debouncer.offer(&code) {
            self.metrics.record_decode_debounced();
            trace!(session_id = %self.id, state = %self.state.as_str(), "decode_dropped");
            return;
        }

        self.attempt += 1;
        let attempt = self.attempt;
        let payload = code.payload;
        info!(
            session_id = %self.id,
            attempt = %attempt,
            code = %payload,
            queued_ms = %code.received_at.elapsed().as_millis(),
            "scan_accepted"
        );
        self.set_state(SessionState::Resolving);

        let pipeline = self.pipeline.clone();
        let operator = self.settings.operator.clone();
        let task_code = payload.clone();
        let handle = tokio::spawn(async move { pipeline.resolve(&task_code, &operator).await });
        self.in_flight = Some(InFlight { attempt, code: payload, handle });
    }

    async fn on_stream_ended(&mut self) {
        self.codes = None;
        warn!(session_id = %self.id, state = %self.state.as_str(), "camera_stream_lost");

        if self.state == SessionState::Resolving {
            // Let the decision land; re-arm re-opens the camera
            self.release_camera().await;
            return;
        }
        self.camera_failed(CameraError::StreamEnded).await;
    }

    fn on_resolved(
        &mut self,
        attempt: u64,
        result: Result<Result<Resolution, ResolutionError>, JoinError>,
    ) {
        let Some(flight) = self.in_flight.take() else {
            return;
        };
        if attempt != self.attempt || self.state != SessionState::Resolving {
            debug!(session_id = %self.id, attempt = %attempt, "stale_resolution_discarded");
            return;
        }

        let code = Some(flight.code);
        match result {
            Ok(Ok(resolution)) => {
                let decision = match resolution.outcome {
                    CheckInOutcome::Created => Decision::Success,
                    CheckInOutcome::AlreadyCheckedIn => Decision::AlreadyDone,
                };
                self.decide(decision, code, Some(resolution.details));
                if let Some(delay) = self.settings.success_rearm {
                    self.rearm_at = Some(Instant::now() + delay);
                }
            }
            Ok(Err(e)) => {
                self.decide(Decision::Error(e.into()), code, None);
                self.rearm_at = Some(Instant::now() + self.settings.error_cooldown);
            }
            Err(e) => {
                error!(session_id = %self.id, attempt = %attempt, error = %e, "resolution_task_failed");
                let err = ResolutionError::BackendUnavailable("resolution task failed".to_string());
                self.decide(Decision::Error(err.into()), code, None);
                self.rearm_at = Some(Instant::now() + self.settings.error_cooldown);
            }
        }
    }

    /// Release the camera if this session holds it, then surface the error.
    /// Camera errors never auto-rearm.
    async fn camera_failed(&mut self, err: CameraError) {
        self.codes = None;
        self.rearm_at = None;
        self.release_camera().await;
        self.metrics.record_camera_error(err);
        warn!(session_id = %self.id, error = ?err, "camera_error");
        self.decide(Decision::Error(err.into()), None, None);
    }

    fn decide(&mut self, decision: Decision, code: Option<String>, details: Option<TicketDetails>) {
        let headline = details.as_ref().map(TicketDetails::headline);
        let (message, recovery) = match &decision {
            Decision::Success => (
                format!("Checked in: {}", headline.unwrap_or_default()),
                RecoveryAction::ScanAnother,
            ),
            Decision::AlreadyDone => {
                let when = details
                    .as_ref()
                    .and_then(|d| d.checked_in_at)
                    .map(|at| format!(" at {}", at.format("%H:%M")))
                    .unwrap_or_default();
                (
                    format!("Already checked in{when}: {}", headline.unwrap_or_default()),
                    RecoveryAction::ScanAnother,
                )
            }
            Decision::Error(e) => (e.to_string(), e.recovery()),
        };

        let event = DecidedEvent {
            session_id: self.id,
            attempt: self.attempt,
            code,
            decision: decision.clone(),
            details,
            message,
            recovery,
            decided_at: Utc::now(),
        };
        info!(
            session_id = %self.id,
            attempt = %event.attempt,
            decision = %decision.as_str(),
            message = %event.message,
            "scan_decided"
        );

        self.last_error = match &decision {
            Decision::Error(e) => Some(e.clone()),
            _ => None,
        };
        self.last_decided = Some(event.clone());
        // No subscribers is fine
        let _ = self.decided_tx.send(event);
        self.set_state(SessionState::Decided(decision));
    }

    async fn release_camera(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.camera.close(lease).await;
        }
    }

    /// Cancel in-flight work and release the camera this session holds
    async fn shutdown(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.abort();
            // An open that completed before the abort still hands back its lease
            if let Ok(Ok(lease)) = opening.await {
                self.lease = Some(lease);
            }
        }
        if let Some(flight) = self.in_flight.take() {
            flight.handle.abort();
            debug!(session_id = %self.id, attempt = %flight.attempt, "resolution_cancelled");
        }
        self.codes = None;
        self.rearm_at = None;
        self.release_camera().await;
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(
                session_id = %self.id,
                from = %self.state.as_str(),
                to = %state.as_str(),
                "session_state_changed"
            );
        }
        self.state = state;
        self.metrics.set_session_state(self.state.gauge());
        self.state_tx.send_replace(SessionSnapshot {
            session_id: self.id,
            state: self.state.clone(),
            last_decided: self.last_decided.clone(),
            last_error: self.last_error.clone(),
        });
    }
}
