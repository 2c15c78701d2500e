//! Idempotent check-in recorder
//!
//! Creation is enforced by the storage-level unique constraint on the ticket,
//! never by a prior read. Only a constraint violation becomes
//! `AlreadyCheckedIn`; every other failure is surfaced as an error.

use crate::domain::errors::{InsertError, ResolutionError};
use crate::domain::types::{CheckInOutcome, EventId, OperatorId, TicketId};
use crate::services::ticket_backend::TicketBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Clone)]
pub struct CheckInRecorder {
    backend: Arc<dyn TicketBackend>,
    timeout: Duration,
}

impl CheckInRecorder {
    pub fn new(backend: Arc<dyn TicketBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub async fn record(
        &self,
        ticket_id: &TicketId,
        event_id: Option<&EventId>,
        operator: &OperatorId,
    ) -> Result<CheckInOutcome, ResolutionError> {
        let insert = self.backend.insert_check_in_record(ticket_id, event_id, operator);
        match timeout(self.timeout, insert).await {
            Ok(Ok(())) => {
                info!(ticket_id = %ticket_id, operator = %operator, "check_in_created");
                Ok(CheckInOutcome::Created)
            }
            Ok(Err(InsertError::Duplicate(violation))) => {
                info!(ticket_id = %violation.ticket_id, "check_in_already_recorded");
                Ok(CheckInOutcome::AlreadyCheckedIn)
            }
            Ok(Err(InsertError::Backend(e))) => {
                warn!(ticket_id = %ticket_id, error = %e, "check_in_insert_failed");
                Err(ResolutionError::BackendUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    ticket_id = %ticket_id,
                    timeout_ms = %self.timeout.as_millis(),
                    "check_in_insert_timeout"
                );
                Err(ResolutionError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory_store::{MemoryTicketStore, StepFault};

    fn recorder(store: &Arc<MemoryTicketStore>) -> CheckInRecorder {
        CheckInRecorder::new(store.clone(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_second_record_is_already_checked_in() {
        let store = Arc::new(MemoryTicketStore::with_demo_data());
        let rec = recorder(&store);
        let ticket = TicketId::new("tkt-0001");
        let op = OperatorId::new("op-1");

        assert_eq!(rec.record(&ticket, None, &op).await, Ok(CheckInOutcome::Created));
        assert_eq!(rec.record(&ticket, None, &op).await, Ok(CheckInOutcome::AlreadyCheckedIn));
        assert_eq!(store.check_in_count(&ticket), 1);
    }

    #[tokio::test]
    async fn test_generic_failure_is_not_already_checked_in() {
        let store = Arc::new(MemoryTicketStore::with_demo_data());
        store.set_fault(StepFault::Insert, true);
        let rec = recorder(&store);

        let result = rec.record(&TicketId::new("tkt-0001"), None, &OperatorId::new("op-1")).await;
        assert!(matches!(result, Err(ResolutionError::BackendUnavailable(_))));
        assert_eq!(store.check_in_count(&TicketId::new("tkt-0001")), 0);
    }

    #[tokio::test]
    async fn test_slow_insert_times_out() {
        let store = Arc::new(MemoryTicketStore::with_demo_data());
        store.set_latency(Some(Duration::from_secs(2)));
        let rec = recorder(&store);

        let result = rec.record(&TicketId::new("tkt-0001"), None, &OperatorId::new("op-1")).await;
        assert_eq!(result, Err(ResolutionError::Timeout));
    }
}
