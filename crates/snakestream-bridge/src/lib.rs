//! snakestream-bridge: wire layer between the snakestream broker and simulation workers.
//!
//! # Architecture
//!
//! - **run_config**: client-supplied `RunConfig` and `DataMode`
//! - **protocol**: message types (`ControlRequest`, `WorkerMessage`, init/step records)
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **worker**: harness driving a `SimulationEngine` inside the worker process

pub mod codec;
pub mod protocol;
pub mod run_config;
pub mod worker;

pub use codec::{CodecError, JsonCodec};
pub use protocol::{ControlRequest, InitRecord, LogLevel, StepRecord, WorkerMessage};
pub use run_config::{ConfigError, DataMode, RunConfig};
pub use worker::{
    EngineError, SimulationEngine, WorkerError, WorkerExit, run_worker, run_worker_on,
};
