//! Domain models - core check-in types
//!
//! This module contains the canonical data types used throughout the engine:
//! - `types` - identifiers, tickets, holders, check-in records and outcomes
//! - `ticket` - the merged ticket display record built by the resolution pipeline
//! - `errors` - camera, resolution and storage error taxonomy

pub mod errors;
pub mod ticket;
pub mod types;

// Re-export commonly used types at module level
pub use errors::{CameraError, ResolutionError, ScanError};
pub use ticket::{ResolutionStep, TicketDetails};
pub use types::{CheckInOutcome, DecodedCode, OperatorId, SessionId, TicketId};
