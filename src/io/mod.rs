//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http_backend` - REST/RPC client for the ticketing backend
//! - `backend_server` - HTTP front serving the backend contract
//! - `memory_store` - In-memory ticket store with fault injection
//! - `serial_scanner` - Serial barcode scanner capture platform
//! - `keyboard_scanner` - Keyboard-wedge (stdin) capture platform
//! - `scripted_camera` - Scriptable capture platform for tests and demos
//! - `egress` - Decision audit log (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod backend_server;
pub mod egress;
pub mod http_backend;
pub mod keyboard_scanner;
pub mod memory_store;
pub mod prometheus;
pub mod scripted_camera;
pub mod serial_scanner;

// Re-export commonly used types
pub use egress::Egress;
pub use http_backend::{is_secure_origin, HttpTicketBackend};
pub use keyboard_scanner::KeyboardScanner;
pub use memory_store::{MemoryTicketStore, StepFault};
pub use scripted_camera::ScriptedCamera;
pub use serial_scanner::SerialScanner;
