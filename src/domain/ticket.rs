//! Ticket display record assembled by the resolution pipeline
//!
//! Every field is optional: each pipeline step contributes what it knows and
//! later steps only fill gaps left by earlier ones.

use crate::domain::types::{EventId, TicketId, TicketStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;

/// Steps of the resolution fallback chain, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStep {
    /// Server-side lookup and check-in in one transaction
    Atomic,
    /// Read-only join across ticket, holder and event
    Joined,
    /// Direct-by-code lookup on the holder/ticket table alone
    Direct,
}

impl ResolutionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStep::Atomic => "atomic",
            ResolutionStep::Joined => "joined",
            ResolutionStep::Direct => "direct",
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        match self {
            ResolutionStep::Atomic => 0,
            ResolutionStep::Joined => 1,
            ResolutionStep::Direct => 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TicketDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<TicketId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TicketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_in_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    /// Steps that contributed at least one field, in the order they ran
    pub sources: SmallVec<[ResolutionStep; 3]>,
}

/// Set `slot` from `value` only when `slot` is empty. Returns true if it was filled.
#[inline]
fn fill<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
    if slot.is_none() && value.is_some() {
        *slot = value;
        true
    } else {
        false
    }
}

impl TicketDetails {
    /// Merge `other` into `self` without overwriting any field already present.
    ///
    /// `other` is tagged as coming from `step`; the step is recorded in
    /// `sources` only if it actually filled something.
    pub fn fill_gaps(&mut self, other: TicketDetails, step: ResolutionStep) {
        let mut filled = false;
        filled |= fill(&mut self.ticket_id, other.ticket_id);
        filled |= fill(&mut self.event_id, other.event_id);
        filled |= fill(&mut self.holder_name, other.holder_name);
        filled |= fill(&mut self.holder_email, other.holder_email);
        filled |= fill(&mut self.ticket_type, other.ticket_type);
        filled |= fill(&mut self.status, other.status);
        filled |= fill(&mut self.checked_in_at, other.checked_in_at);
        filled |= fill(&mut self.price_cents, other.price_cents);
        filled |= fill(&mut self.currency, other.currency);
        filled |= fill(&mut self.event_name, other.event_name);
        filled |= fill(&mut self.event_starts_at, other.event_starts_at);
        filled |= fill(&mut self.venue, other.venue);

        if filled && !self.sources.contains(&step) {
            self.sources.push(step);
        }
    }

    /// True when any display field is still missing
    pub fn has_gaps(&self) -> bool {
        self.ticket_id.is_none()
            || self.event_id.is_none()
            || self.holder_name.is_none()
            || self.holder_email.is_none()
            || self.ticket_type.is_none()
            || self.price_cents.is_none()
            || self.event_name.is_none()
    }

    /// Short line for operator display and logs
    pub fn headline(&self) -> String {
        let holder = self.holder_name.as_deref().unwrap_or("unnamed holder");
        match (&self.ticket_type, &self.event_name) {
            (Some(kind), Some(event)) => format!("{holder} - {kind} - {event}"),
            (Some(kind), None) => format!("{holder} - {kind}"),
            (None, Some(event)) => format!("{holder} - {event}"),
            (None, None) => holder.to_string(),
        }
    }
}
