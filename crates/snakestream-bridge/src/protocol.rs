//! Wire protocol types for broker-worker communication.
//!
//! One duplex channel per worker:
//! - **stdin** (broker → worker): [`ControlRequest`], the run configuration, then an optional stop.
//! - **stdout** (worker → broker): [`WorkerMessage`], one init record, step records, logs.
//!
//! End of stream is the worker closing stdout, whether it finished cleanly or crashed.

use serde::{Deserialize, Serialize};

use crate::run_config::RunConfig;

/// Run metadata emitted once by the worker before any step.
///
/// Forwarded verbatim to the client. The pixel encoder reads grid size and palette from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitRecord(pub serde_json::Value);

/// One simulation tick, forwarded verbatim in `steps` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepRecord(pub serde_json::Value);

impl InitRecord {
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl StepRecord {
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Messages from broker to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Run configuration, sent immediately after spawn (must be first message).
    Init { config: RunConfig },

    /// Cooperative shutdown request. The worker answers with `Stopping` and exits.
    Stop,
}

/// Messages from worker to broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Init {
        data: InitRecord,
    },

    Step {
        data: StepRecord,
    },

    /// Worker-side log line, re-emitted by the broker's tracing subscriber.
    Log {
        level: LogLevel,
        message: String,
    },

    /// Unrecoverable engine error. The worker exits right after sending this.
    Fatal {
        reason: String,
    },

    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}
