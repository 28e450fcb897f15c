//! Admission control for streaming sessions.
//!
//! The controller caps the number of live sessions. A successful admission yields a
//! [`SessionPermit`]; the slot is released exactly once, either explicitly through
//! [`SessionPermit::release`] or when the permit is dropped.

mod controller;
mod permit;

pub use controller::{AdmissionController, AdmissionError, SessionId, SessionInfo};
pub use permit::SessionPermit;
