//! Ticket backend interface
//!
//! The four calls the engine consumes from the ticketing backend. Payload
//! structs double as the JSON wire format of the HTTP contract.

use crate::domain::errors::{BackendError, InsertError};
use crate::domain::ticket::TicketDetails;
use crate::domain::types::{EventId, OperatorId, TicketId, TicketStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome reported by the server-side resolve-and-check-in procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtomicOutcome {
    Created,
    AlreadyCheckedIn,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicTicket {
    pub id: TicketId,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub holder_name: Option<String>,
    #[serde(default)]
    pub holder_email: Option<String>,
    #[serde(default)]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub checked_in_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicCheckIn {
    pub outcome: AtomicOutcome,
    #[serde(default)]
    pub ticket: Option<AtomicTicket>,
}

impl AtomicCheckIn {
    pub fn details(&self) -> TicketDetails {
        match &self.ticket {
            Some(t) => TicketDetails {
                ticket_id: Some(t.id.clone()),
                event_id: t.event_id.clone(),
                holder_name: t.holder_name.clone(),
                holder_email: t.holder_email.clone(),
                ticket_type: t.ticket_type.clone(),
                checked_in_at: t.checked_in_at,
                ..Default::default()
            },
            None => TicketDetails::default(),
        }
    }
}

/// Row of the joined read across ticket, holder and event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedTicket {
    pub ticket_id: TicketId,
    pub event_id: EventId,
    pub status: TicketStatus,
    #[serde(default)]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub price_cents: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub checked_in_at: Option<DateTime<Utc>>,
    pub holder_name: String,
    pub holder_email: String,
    pub event_name: String,
    #[serde(default)]
    pub event_starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub venue: Option<String>,
}

impl From<JoinedTicket> for TicketDetails {
    fn from(row: JoinedTicket) -> Self {
        TicketDetails {
            ticket_id: Some(row.ticket_id),
            event_id: Some(row.event_id),
            holder_name: Some(row.holder_name),
            holder_email: Some(row.holder_email),
            ticket_type: row.ticket_type,
            status: Some(row.status),
            checked_in_at: row.checked_in_at,
            price_cents: row.price_cents,
            currency: row.currency,
            event_name: Some(row.event_name),
            event_starts_at: row.event_starts_at,
            venue: row.venue,
            sources: Default::default(),
        }
    }
}

/// Row of the direct-by-code lookup. Event and price data may be missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HolderByCode {
    pub ticket_id: TicketId,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub ticket_type: Option<String>,
    #[serde(default)]
    pub holder_name: Option<String>,
    #[serde(default)]
    pub holder_email: Option<String>,
}

impl From<HolderByCode> for TicketDetails {
    fn from(row: HolderByCode) -> Self {
        TicketDetails {
            ticket_id: Some(row.ticket_id),
            event_id: row.event_id,
            holder_name: row.holder_name,
            holder_email: row.holder_email,
            ticket_type: row.ticket_type,
            status: row.status,
            ..Default::default()
        }
    }
}

/// Backend calls consumed by the resolution pipeline and the recorder
#[async_trait]
pub trait TicketBackend: Send + Sync {
    /// Look up the ticket by code and check it in within one transaction
    async fn resolve_and_check_in(
        &self,
        code: &str,
        operator: &OperatorId,
    ) -> Result<AtomicCheckIn, BackendError>;

    /// Read-only join across ticket, holder and event. `None` when no row matches.
    async fn find_ticket_by_code_joined(
        &self,
        code: &str,
    ) -> Result<Option<JoinedTicket>, BackendError>;

    /// Direct lookup on the ticket/holder table alone
    async fn find_holder_by_code(&self, code: &str) -> Result<Option<HolderByCode>, BackendError>;

    /// Insert through the unique-on-ticket constraint
    async fn insert_check_in_record(
        &self,
        ticket_id: &TicketId,
        event_id: Option<&EventId>,
        operator: &OperatorId,
    ) -> Result<(), InsertError>;
}
