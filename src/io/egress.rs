//! Decision egress - audit log of every Decided event
//!
//! Decisions are written in JSONL format (one JSON object per line)
//! to the file specified in config.

use crate::services::session::DecidedEvent;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Egress writer for decisions
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a decision to the egress file
    /// Returns true if successful, false otherwise
    pub fn write_decision(&self, event: &DecidedEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!(attempt = %event.attempt, error = %e, "decision_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(
                    session_id = %event.session_id,
                    attempt = %event.attempt,
                    decision = %event.decision.as_str(),
                    "decision_egressed"
                );
                true
            }
            Err(e) => {
                error!(
                    session_id = %event.session_id,
                    attempt = %event.attempt,
                    error = %e,
                    "decision_egress_failed"
                );
                false
            }
        }
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Write every decision from `decided` until the session goes away
    pub async fn run(self, mut decided: broadcast::Receiver<DecidedEvent>) {
        loop {
            match decided.recv().await {
                Ok(event) => {
                    self.write_decision(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = %skipped, "egress_lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!(file_path = %self.file_path, "egress_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{CameraError, RecoveryAction, ScanError};
    use crate::domain::types::SessionId;
    use crate::services::session::Decision;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    fn camera_failure() -> DecidedEvent {
        DecidedEvent {
            session_id: SessionId::new(),
            attempt: 0,
            code: None,
            decision: Decision::Error(ScanError::Camera(CameraError::PermissionDenied)),
            details: None,
            message: CameraError::PermissionDenied.to_string(),
            recovery: RecoveryAction::Retry,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_write_decision() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("checkins.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        assert!(egress.write_decision(&camera_failure()));
        assert!(egress.write_decision(&camera_failure()));

        let content = fs::read_to_string(&file_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["decision"]["result"], "error");
        assert_eq!(parsed["decision"]["error"]["kind"], "camera");
        assert_eq!(parsed["decision"]["error"]["error"], "permission_denied");
        assert_eq!(parsed["recovery"], "retry");
        assert!(parsed.get("code").is_none());
    }

    #[tokio::test]
    async fn test_run_drains_until_closed() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("checkins.jsonl");
        let egress = Egress::new(file_path.to_str().unwrap());

        let (tx, rx) = broadcast::channel(8);
        tx.send(camera_failure()).unwrap();
        drop(tx);
        egress.run(rx).await;

        let content = fs::read_to_string(&file_path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
