//! Ticket resolution pipeline
//!
//! Ordered fallback chain, each step bounded by the step timeout:
//! 1. atomic resolve-and-check-in (server commits the admission)
//! 2. joined read across ticket, holder and event
//! 3. direct-by-code lookup, accepting partial event/price data
//!
//! Step-1 fields take precedence; later steps only fill gaps. When a fallback
//! supplied the ticket, the check-in is committed by the recorder.
//!
//! A timed-out atomic call may still have committed on the server. If the
//! recorder then hits the unique constraint, the outcome is AlreadyCheckedIn
//! and the resolution is flagged `atomic_timed_out` so the ambiguity is visible.

use crate::domain::errors::{BackendError, ResolutionError};
use crate::domain::ticket::{ResolutionStep, TicketDetails};
use crate::domain::types::{CheckInOutcome, OperatorId, TicketStatus};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::recorder::CheckInRecorder;
use crate::services::ticket_backend::{AtomicOutcome, TicketBackend};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Which component committed the check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPath {
    /// Server-side, inside the atomic call
    Atomic,
    /// Client-side insert through the unique constraint
    Recorder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub outcome: CheckInOutcome,
    pub details: TicketDetails,
    pub committed_by: CommitPath,
    /// The atomic call timed out before this resolution fell back
    pub atomic_timed_out: bool,
}

/// Why a step produced no data
#[derive(Debug, Clone, PartialEq)]
enum StepVerdict {
    NoRow,
    TimedOut,
    Failed(BackendError),
}

impl StepVerdict {
    fn into_error(self) -> ResolutionError {
        match self {
            StepVerdict::NoRow => ResolutionError::NotFound,
            StepVerdict::TimedOut => ResolutionError::Timeout,
            StepVerdict::Failed(e) => ResolutionError::BackendUnavailable(e.to_string()),
        }
    }
}

pub struct ResolutionPipeline {
    backend: Arc<dyn TicketBackend>,
    recorder: CheckInRecorder,
    step_timeout: Duration,
    fallback_on_not_found: bool,
    metrics: Arc<Metrics>,
}

impl ResolutionPipeline {
    pub fn new(
        backend: Arc<dyn TicketBackend>,
        step_timeout: Duration,
        fallback_on_not_found: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        let recorder = CheckInRecorder::new(backend.clone(), step_timeout);
        Self { backend, recorder, step_timeout, fallback_on_not_found, metrics }
    }

    pub fn from_config(
        backend: Arc<dyn TicketBackend>,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::new(backend, config.step_timeout(), config.fallback_on_not_found(), metrics)
    }

    /// Resolve a decoded code and commit the admission exactly once
    pub async fn resolve(
        &self,
        code: &str,
        operator: &OperatorId,
    ) -> Result<Resolution, ResolutionError> {
        let start = Instant::now();
        self.metrics.record_resolution_started();

        let result = self.run(code, operator).await;

        let latency_ms = start.elapsed().as_millis() as u64;
        self.metrics.record_resolution(result.as_ref().map(|r| r.outcome), latency_ms);
        match &result {
            Ok(resolution) => info!(
                code = %code,
                outcome = %resolution.outcome.as_str(),
                committed_by = ?resolution.committed_by,
                sources = ?resolution.details.sources,
                latency_ms = %latency_ms,
                "ticket_resolved"
            ),
            Err(e) => warn!(
                code = %code,
                error = %e,
                kind = %e.as_str(),
                latency_ms = %latency_ms,
                "ticket_resolution_failed"
            ),
        }
        result
    }

    async fn run(&self, code: &str, operator: &OperatorId) -> Result<Resolution, ResolutionError> {
        let verdict = match self
            .step(ResolutionStep::Atomic, self.backend.resolve_and_check_in(code, operator))
            .await
        {
            Ok(response) => {
                let outcome = match response.outcome {
                    AtomicOutcome::Created => Some(CheckInOutcome::Created),
                    AtomicOutcome::AlreadyCheckedIn => Some(CheckInOutcome::AlreadyCheckedIn),
                    AtomicOutcome::NotFound => None,
                };
                if let Some(outcome) = outcome {
                    let mut details = TicketDetails::default();
                    details.fill_gaps(response.details(), ResolutionStep::Atomic);
                    if details.has_gaps() {
                        self.enrich(code, &mut details).await;
                    }
                    return Ok(Resolution {
                        outcome,
                        details,
                        committed_by: CommitPath::Atomic,
                        atomic_timed_out: false,
                    });
                }
                if !self.fallback_on_not_found {
                    return Err(ResolutionError::NotFound);
                }
                debug!(code = %code, "atomic_not_found_trying_fallbacks");
                StepVerdict::NoRow
            }
            Err(verdict) => verdict,
        };

        let atomic_timed_out = verdict == StepVerdict::TimedOut;
        let (details, verdict) = self.fallback(code, verdict).await;
        let Some(ticket_id) = details.ticket_id.clone() else {
            return Err(verdict.into_error());
        };

        let status = details.status.unwrap_or(TicketStatus::Active);
        if !status.is_admissible() {
            return Err(ResolutionError::NotAdmissible(status));
        }

        let outcome = self.recorder.record(&ticket_id, details.event_id.as_ref(), operator).await?;
        if atomic_timed_out && outcome == CheckInOutcome::AlreadyCheckedIn {
            // The duplicate may be this scan's own commit from the timed-out call
            warn!(code = %code, ticket_id = %ticket_id, "atomic_timed_out_then_duplicate");
        }
        Ok(Resolution { outcome, details, committed_by: CommitPath::Recorder, atomic_timed_out })
    }

    /// Steps 2 and 3. Returns whatever data was found plus the last verdict.
    async fn fallback(&self, code: &str, mut verdict: StepVerdict) -> (TicketDetails, StepVerdict) {
        let mut details = TicketDetails::default();

        match self.step(ResolutionStep::Joined, self.backend.find_ticket_by_code_joined(code)).await
        {
            Ok(Some(row)) => details.fill_gaps(row.into(), ResolutionStep::Joined),
            Ok(None) => verdict = StepVerdict::NoRow,
            Err(v) => verdict = v,
        }

        if details.ticket_id.is_none() {
            match self.step(ResolutionStep::Direct, self.backend.find_holder_by_code(code)).await {
                Ok(Some(row)) => details.fill_gaps(row.into(), ResolutionStep::Direct),
                Ok(None) => verdict = StepVerdict::NoRow,
                Err(v) => verdict = v,
            }
        }

        (details, verdict)
    }

    /// Fill gaps left by the atomic call. Failures never change the outcome.
    async fn enrich(&self, code: &str, details: &mut TicketDetails) {
        match self.step(ResolutionStep::Joined, self.backend.find_ticket_by_code_joined(code)).await
        {
            Ok(Some(row)) => details.fill_gaps(row.into(), ResolutionStep::Joined),
            Ok(None) => debug!(code = %code, "enrichment_no_row"),
            Err(verdict) => debug!(code = %code, verdict = ?verdict, "enrichment_failed"),
        }
    }

    async fn step<T>(
        &self,
        step: ResolutionStep,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, StepVerdict> {
        let result = match timeout(self.step_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(step = %step.as_str(), error = %e, "resolution_step_failed");
                Err(StepVerdict::Failed(e))
            }
            Err(_) => {
                warn!(
                    step = %step.as_str(),
                    timeout_ms = %self.step_timeout.as_millis(),
                    "resolution_step_timeout"
                );
                Err(StepVerdict::TimedOut)
            }
        };
        self.metrics.record_step(step, result.is_ok());
        result
    }
}
