//! Services - check-in engine logic and state management
//!
//! This module contains the core engine services:
//! - `camera` - Capture device lifetime and frame pump
//! - `debouncer` - One resolution per busy window
//! - `ticket_backend` - Backend calls consumed by the engine
//! - `resolver` - Ordered fallback resolution pipeline
//! - `recorder` - Idempotent check-in insert
//! - `session` - Scan session state machine

pub mod camera;
pub mod debouncer;
pub mod recorder;
pub mod resolver;
pub mod session;
pub mod ticket_backend;

// Re-export commonly used types
pub use camera::{CameraLease, CameraSessionManager, CaptureDevice, CapturePlatform};
pub use resolver::ResolutionPipeline;
pub use session::{create_scan_session, ScanSession, ScanSessionHandle, SessionState};
pub use ticket_backend::TicketBackend;
