//! In-memory ticket store
//!
//! Reference implementation of `TicketBackend`. All tables live under one
//! lock, so the atomic resolve-and-check-in call is a single critical section
//! and the unique-on-ticket constraint holds under any interleaving.
//!
//! The atomic procedure refuses pending and cancelled tickets with a 422
//! error rather than NOT_FOUND, so the fallback reads can report the status.

use crate::domain::errors::{BackendError, InsertError, UniqueConstraintViolation};
use crate::domain::types::{
    CheckInRecord, EventId, EventSummary, HolderId, OperatorId, Ticket, TicketHolder, TicketId,
    TicketStatus,
};
use crate::services::ticket_backend::{
    AtomicCheckIn, AtomicOutcome, AtomicTicket, HolderByCode, JoinedTicket, TicketBackend,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Backend call that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFault {
    Atomic,
    Joined,
    Direct,
    Insert,
}

impl StepFault {
    #[inline]
    fn index(self) -> usize {
        match self {
            StepFault::Atomic => 0,
            StepFault::Joined => 1,
            StepFault::Direct => 2,
            StepFault::Insert => 3,
        }
    }
}

/// Seed file layout (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub events: Vec<EventSummary>,
    #[serde(default)]
    pub holders: Vec<TicketHolder>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
}

#[derive(Default)]
struct Tables {
    tickets: FxHashMap<TicketId, Ticket>,
    by_code: FxHashMap<String, TicketId>,
    holders: FxHashMap<HolderId, TicketHolder>,
    events: FxHashMap<EventId, EventSummary>,
    /// Unique on ticket id
    check_ins: FxHashMap<TicketId, CheckInRecord>,
}

impl Tables {
    fn ticket_by_code(&self, code: &str) -> Option<&Ticket> {
        self.by_code.get(code).and_then(|id| self.tickets.get(id))
    }

    fn holder_of(&self, ticket: &Ticket) -> Option<&TicketHolder> {
        ticket.holder_id.as_ref().and_then(|id| self.holders.get(id))
    }

    fn insert_check_in(
        &mut self,
        ticket_id: &TicketId,
        event_id: Option<&EventId>,
        operator: &OperatorId,
    ) -> Result<(), InsertError> {
        if self.check_ins.contains_key(ticket_id) {
            return Err(UniqueConstraintViolation { ticket_id: ticket_id.clone() }.into());
        }
        let Some(ticket) = self.tickets.get_mut(ticket_id) else {
            return Err(BackendError::Status {
                status: 422,
                body: format!("unknown ticket {ticket_id}"),
            }
            .into());
        };

        let now = Utc::now();
        ticket.status = TicketStatus::Used;
        ticket.checked_in_at = Some(now);
        let record = CheckInRecord {
            ticket_id: ticket_id.clone(),
            event_id: event_id.cloned().or_else(|| Some(ticket.event_id.clone())),
            operator_id: operator.clone(),
            checked_in_at: now,
        };
        self.check_ins.insert(ticket_id.clone(), record);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTicketStore {
    tables: Mutex<Tables>,
    faults: [AtomicBool; 4],
    latency: Mutex<Option<Duration>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with one event, two holders and tickets covering every status
    ///
    /// `PLKTK000005` has no holder, so the joined read finds no row for it.
    pub fn with_demo_data() -> Self {
        let store = Self::new();
        let event = EventId::new("evt-main");
        store.insert_event(EventSummary {
            event_id: event.clone(),
            name: "Summer Open Air".to_string(),
            starts_at: Utc.with_ymd_and_hms(2026, 7, 18, 17, 0, 0).single(),
            venue: Some("Harbour Stage".to_string()),
        });
        store.insert_holder(TicketHolder {
            holder_id: HolderId::new("hld-ada"),
            name: "Ada Lovelace".to_string(),
            email: "ada@example.com".to_string(),
        });
        store.insert_holder(TicketHolder {
            holder_id: HolderId::new("hld-grace"),
            name: "Grace Hopper".to_string(),
            email: "grace@example.com".to_string(),
        });

        let demo = [
            ("tkt-0001", "PLKTK000001", Some("hld-ada"), TicketStatus::Active, "VIP", 9500),
            ("tkt-0002", "PLKTK000002", Some("hld-grace"), TicketStatus::Active, "General", 4500),
            ("tkt-0003", "PLKTK000003", Some("hld-grace"), TicketStatus::Pending, "General", 4500),
            ("tkt-0004", "PLKTK000004", Some("hld-ada"), TicketStatus::Cancelled, "General", 4500),
            ("tkt-0005", "PLKTK000005", None, TicketStatus::Active, "Staff", 0),
        ];
        for (id, code, holder, status, kind, price) in demo {
            store.insert_ticket(Ticket {
                ticket_id: TicketId::new(id),
                event_id: event.clone(),
                holder_id: holder.map(HolderId::new),
                qr_code: code.to_string(),
                status,
                ticket_type: Some(kind.to_string()),
                price_cents: Some(price),
                currency: Some("EUR".to_string()),
                checked_in_at: None,
            });
        }
        store
    }

    /// Load events, holders and tickets from a JSON seed file
    pub fn from_seed_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let seed: SeedData = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse seed file {}", path.display()))?;

        let store = Self::new();
        seed.events.into_iter().for_each(|e| store.insert_event(e));
        seed.holders.into_iter().for_each(|h| store.insert_holder(h));
        seed.tickets.into_iter().for_each(|t| store.insert_ticket(t));
        Ok(store)
    }

    pub fn insert_event(&self, event: EventSummary) {
        self.tables.lock().events.insert(event.event_id.clone(), event);
    }

    pub fn insert_holder(&self, holder: TicketHolder) {
        self.tables.lock().holders.insert(holder.holder_id.clone(), holder);
    }

    pub fn insert_ticket(&self, ticket: Ticket) {
        let mut tables = self.tables.lock();
        tables.by_code.insert(ticket.qr_code.clone(), ticket.ticket_id.clone());
        tables.tickets.insert(ticket.ticket_id.clone(), ticket);
    }

    pub fn set_fault(&self, step: StepFault, failing: bool) {
        self.faults[step.index()].store(failing, Ordering::Relaxed);
    }

    /// Artificial latency applied before every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of check-in records for a ticket (0 or 1)
    pub fn check_in_count(&self, ticket_id: &TicketId) -> usize {
        usize::from(self.tables.lock().check_ins.contains_key(ticket_id))
    }

    pub fn check_ins(&self) -> Vec<CheckInRecord> {
        self.tables.lock().check_ins.values().cloned().collect()
    }

    pub fn ticket(&self, ticket_id: &TicketId) -> Option<Ticket> {
        self.tables.lock().tickets.get(ticket_id).cloned()
    }

    async fn enter(&self, step: StepFault) -> Result<(), BackendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.faults[step.index()].load(Ordering::Relaxed) {
            debug!(step = ?step, "memory_store_fault_injected");
            return Err(BackendError::Transport(format!("injected fault on {step:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketBackend for MemoryTicketStore {
    async fn resolve_and_check_in(
        &self,
        code: &str,
        operator: &OperatorId,
    ) -> Result<AtomicCheckIn, BackendError> {
        self.enter(StepFault::Atomic).await?;

        let mut tables = self.tables.lock();
        let Some(ticket) = tables.ticket_by_code(code).cloned() else {
            return Ok(AtomicCheckIn { outcome: AtomicOutcome::NotFound, ticket: None });
        };
        if !ticket.status.is_admissible() {
            return Err(BackendError::Status {
                status: 422,
                body: format!("ticket {} is {}", ticket.ticket_id, ticket.status.as_str()),
            });
        }

        let outcome = match tables.insert_check_in(&ticket.ticket_id, None, operator) {
            Ok(()) => AtomicOutcome::Created,
            Err(InsertError::Duplicate(_)) => AtomicOutcome::AlreadyCheckedIn,
            Err(InsertError::Backend(e)) => return Err(e),
        };

        let holder = tables.holder_of(&ticket);
        let checked_in_at = tables.check_ins.get(&ticket.ticket_id).map(|r| r.checked_in_at);
        Ok(AtomicCheckIn {
            outcome,
            ticket: Some(AtomicTicket {
                id: ticket.ticket_id.clone(),
                event_id: Some(ticket.event_id.clone()),
                holder_name: holder.map(|h| h.name.clone()),
                holder_email: holder.map(|h| h.email.clone()),
                ticket_type: ticket.ticket_type.clone(),
                checked_in_at,
            }),
        })
    }

    async fn find_ticket_by_code_joined(
        &self,
        code: &str,
    ) -> Result<Option<JoinedTicket>, BackendError> {
        self.enter(StepFault::Joined).await?;

        let tables = self.tables.lock();
        let Some(ticket) = tables.ticket_by_code(code) else {
            return Ok(None);
        };
        // Inner join: a null holder or a missing event yields no row
        let (Some(holder), Some(event)) =
            (tables.holder_of(ticket), tables.events.get(&ticket.event_id))
        else {
            return Ok(None);
        };

        Ok(Some(JoinedTicket {
            ticket_id: ticket.ticket_id.clone(),
            event_id: ticket.event_id.clone(),
            status: ticket.status,
            ticket_type: ticket.ticket_type.clone(),
            price_cents: ticket.price_cents,
            currency: ticket.currency.clone(),
            checked_in_at: ticket.checked_in_at,
            holder_name: holder.name.clone(),
            holder_email: holder.email.clone(),
            event_name: event.name.clone(),
            event_starts_at: event.starts_at,
            venue: event.venue.clone(),
        }))
    }

    async fn find_holder_by_code(&self, code: &str) -> Result<Option<HolderByCode>, BackendError> {
        self.enter(StepFault::Direct).await?;

        let tables = self.tables.lock();
        Ok(tables.ticket_by_code(code).map(|ticket| {
            let holder = tables.holder_of(ticket);
            HolderByCode {
                ticket_id: ticket.ticket_id.clone(),
                event_id: Some(ticket.event_id.clone()),
                status: Some(ticket.status),
                ticket_type: ticket.ticket_type.clone(),
                holder_name: holder.map(|h| h.name.clone()),
                holder_email: holder.map(|h| h.email.clone()),
            }
        }))
    }

    async fn insert_check_in_record(
        &self,
        ticket_id: &TicketId,
        event_id: Option<&EventId>,
        operator: &OperatorId,
    ) -> Result<(), InsertError> {
        self.enter(StepFault::Insert).await?;
        self.tables.lock().insert_check_in(ticket_id, event_id, operator)
    }
}
