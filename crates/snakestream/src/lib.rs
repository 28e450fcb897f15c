//! snakestream: real-time simulation streaming broker.
//!
//! Each WebSocket client gets its own simulation worker process. Records the
//! worker emits are relayed to the client either as JSON steps or as binary
//! pixel batches, paced by a timer or by client credit.
//!
//! # Architecture
//!
//! - **admission**: live-session registry with a hard concurrency cap
//! - **worker_bridge**: spawn a worker and read its records in order
//! - **encoder** / **frame**: turn step records into client frames
//! - **flow**: timed or credit-based delivery to the client
//! - **session**: the per-connection state machine
//! - **service**: session lifecycle and shutdown, shared by all transports
//! - **transport**: WebSocket server and an in-memory connection

pub mod admission;
pub mod cli;
pub mod encoder;
pub mod flow;
pub mod frame;
mod health;
pub mod logging;
pub mod service;
pub mod session;
pub mod transport;
mod version;
pub mod worker_bridge;

pub use admission::{AdmissionController, AdmissionError, SessionId, SessionInfo, SessionPermit};
pub use health::Health;
pub use service::{HealthSnapshot, StreamService};
pub use session::{SessionEnd, SessionError, SessionSettings, SessionSummary};
pub use version::{SNAKESTREAM_VERSION, VersionInfo};
pub use worker_bridge::{CommandSpawner, TaskSpawner, WorkerSpawner};
