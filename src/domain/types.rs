//! Shared types for the check-in engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Newtype wrappers for backend identifiers to provide type safety
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// One admission right
    TicketId
);
string_id!(EventId);
string_id!(HolderId);
string_id!(
    /// Gate staff member performing the scan
    OperatorId
);

/// Scan session identifier (UUIDv7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw payload from a single frame decode
#[derive(Debug, Clone)]
pub struct DecodedCode {
    pub payload: String,
    pub received_at: Instant,
}

impl DecodedCode {
    pub fn new(payload: impl Into<String>) -> Self {
        Self { payload: payload.into(), received_at: Instant::now() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Used,
    Pending,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Active => "active",
            TicketStatus::Used => "used",
            TicketStatus::Pending => "pending",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Whether a ticket in this status may be handed to the recorder.
    /// `Used` is admissible here: the uniqueness constraint reports the repeat.
    #[inline]
    pub fn is_admissible(&self) -> bool {
        matches!(self, TicketStatus::Active | TicketStatus::Used)
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TicketStatus::Active),
            "used" => Ok(TicketStatus::Used),
            "pending" => Ok(TicketStatus::Pending),
            "cancelled" => Ok(TicketStatus::Cancelled),
            other => Err(format!("unknown ticket status: {other}")),
        }
    }
}

/// Ticket row as owned by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub event_id: EventId,
    pub holder_id: Option<HolderId>,
    pub qr_code: String,
    pub status: TicketStatus,
    pub ticket_type: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub checked_in_at: Option<DateTime<Utc>>,
}

/// Named person using the ticket (may differ from the purchaser)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketHolder {
    pub holder_id: HolderId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: EventId,
    pub name: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
}

/// Durable proof of admission. At most one exists per ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub ticket_id: TicketId,
    pub event_id: Option<EventId>,
    pub operator_id: OperatorId,
    pub checked_in_at: DateTime<Utc>,
}

/// Result of committing an admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckInOutcome {
    Created,
    AlreadyCheckedIn,
}

impl CheckInOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInOutcome::Created => "created",
            CheckInOutcome::AlreadyCheckedIn => "already_checked_in",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_status_from_str() {
        assert_eq!("active".parse::<TicketStatus>().unwrap(), TicketStatus::Active);
        assert_eq!("cancelled".parse::<TicketStatus>().unwrap(), TicketStatus::Cancelled);
        assert!("refunded".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_ticket_status_admissible() {
        assert!(TicketStatus::Active.is_admissible());
        assert!(TicketStatus::Used.is_admissible());
        assert!(!TicketStatus::Pending.is_admissible());
        assert!(!TicketStatus::Cancelled.is_admissible());
    }

    #[test]
    fn test_outcome_wire_format() {
        let json = serde_json::to_string(&CheckInOutcome::AlreadyCheckedIn).unwrap();
        assert_eq!(json, "\"ALREADY_CHECKED_IN\"");
        let parsed: CheckInOutcome = serde_json::from_str("\"CREATED\"").unwrap();
        assert_eq!(parsed, CheckInOutcome::Created);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
