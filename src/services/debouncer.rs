//! Scan debouncer - one resolution per busy window
//!
//! The first accepted code marks the session busy. Every later decode is
//! dropped, same code or not, until the caller re-arms.

use crate::domain::types::DecodedCode;
use tracing::trace;

#[derive(Debug, Default)]
pub struct ScanDebouncer {
    in_flight: Option<String>,
    accepted: u64,
    dropped: u64,
}

impl ScanDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a decode. Returns true only if it should enter the pipeline.
    pub fn offer(&mut self, code: &DecodedCode) -> bool {
        if let Some(current) = &self.in_flight {
            self.dropped += 1;
            trace!(
                same_code = %(current == &code.payload),
                age_ms = %code.received_at.elapsed().as_millis(),
                "decode_debounced"
            );
            return false;
        }
        self.in_flight = Some(code.payload.clone());
        self.accepted += 1;
        true
    }

    /// Allow the next decode through
    pub fn rearm(&mut self) {
        self.in_flight = None;
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_code_accepted_rest_dropped() {
        let mut debouncer = ScanDebouncer::new();
        let code = DecodedCode::new("PLKTK000001");

        let accepted = (0..50).filter(|_| debouncer.offer(&code)).count();
        assert_eq!(accepted, 1);
        assert_eq!(debouncer.accepted(), 1);
        assert_eq!(debouncer.dropped(), 49);
        assert_eq!(debouncer.in_flight(), Some("PLKTK000001"));
    }

    #[test]
    fn test_different_code_dropped_while_busy() {
        let mut debouncer = ScanDebouncer::new();
        assert!(debouncer.offer(&DecodedCode::new("A")));
        assert!(!debouncer.offer(&DecodedCode::new("B")));
        assert_eq!(debouncer.in_flight(), Some("A"));
    }

    #[test]
    fn test_rearm_allows_next_code() {
        let mut debouncer = ScanDebouncer::new();
        assert!(debouncer.offer(&DecodedCode::new("A")));
        debouncer.rearm();
        assert!(!debouncer.is_busy());
        assert!(debouncer.offer(&DecodedCode::new("A")));
        assert_eq!(debouncer.accepted(), 2);
    }
}
