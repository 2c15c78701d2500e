//! Error taxonomy for the check-in engine
//!
//! - `CameraError` is fatal to the session and offers a retry.
//! - `ResolutionError` is recoverable; the session re-arms after a cooldown.
//! - `UniqueConstraintViolation` is not an operator-facing error at all: the
//!   recorder turns it into `CheckInOutcome::AlreadyCheckedIn`.

use crate::domain::types::{TicketId, TicketStatus};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraError {
    #[error("camera capture is not supported on this device")]
    Unsupported,
    #[error("camera access requires a secure (HTTPS or local) origin")]
    InsecureContext,
    #[error("camera permission was denied")]
    PermissionDenied,
    #[error("camera is busy or could not be acquired in time")]
    DeviceBusy,
    #[error("camera stream ended unexpectedly")]
    StreamEnded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("no ticket matches this code")]
    NotFound,
    #[error("ticket service unavailable: {0}")]
    BackendUnavailable(String),
    #[error("ticket service did not answer in time")]
    Timeout,
    #[error("ticket is {} and cannot be admitted", .0.as_str())]
    NotAdmissible(TicketStatus),
}

impl ResolutionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionError::NotFound => "not_found",
            ResolutionError::BackendUnavailable(_) => "backend_unavailable",
            ResolutionError::Timeout => "timeout",
            ResolutionError::NotAdmissible(_) => "not_admissible",
        }
    }
}

/// Failure of a single backend call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Decode(String),
}

/// The storage layer rejected a second check-in for the same ticket
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("check-in already recorded for ticket {ticket_id}")]
pub struct UniqueConstraintViolation {
    pub ticket_id: TicketId,
}

/// Failure of `insert_check_in_record`. A duplicate is kept distinct from
/// every other failure so callers never have to guess.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error(transparent)]
    Duplicate(#[from] UniqueConstraintViolation),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Single recovery action offered to the operator for an error state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-open the camera
    Retry,
    /// Re-arm the scanner for the next ticket
    ScanAnother,
}

/// Any error that ends a scan attempt in `Decided(Error)`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "error", rename_all = "snake_case")]
pub enum ScanError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl ScanError {
    pub fn recovery(&self) -> RecoveryAction {
        match self {
            ScanError::Camera(_) => RecoveryAction::Retry,
            ScanError::Resolution(_) => RecoveryAction::ScanAnother,
        }
    }

    /// Camera errors are fatal to the session and never auto-rearm
    #[inline]
    pub fn is_camera(&self) -> bool {
        matches!(self, ScanError::Camera(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_actions() {
        assert_eq!(ScanError::from(CameraError::PermissionDenied).recovery(), RecoveryAction::Retry);
        assert_eq!(
            ScanError::from(ResolutionError::NotFound).recovery(),
            RecoveryAction::ScanAnother
        );
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = ScanError::from(ResolutionError::NotAdmissible(TicketStatus::Cancelled));
        assert_eq!(err.to_string(), "ticket is cancelled and cannot be admitted");
        assert_eq!(CameraError::PermissionDenied.to_string(), "camera permission was denied");
    }

    #[test]
    fn test_insert_error_keeps_duplicate_distinct() {
        let dup: InsertError =
            UniqueConstraintViolation { ticket_id: TicketId::new("t-1") }.into();
        assert!(matches!(dup, InsertError::Duplicate(_)));

        let other: InsertError = BackendError::Transport("reset".to_string()).into();
        assert!(matches!(other, InsertError::Backend(_)));
    }
}
