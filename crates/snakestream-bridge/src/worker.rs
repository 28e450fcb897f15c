//! Worker-side harness - runs inside the simulation worker process.
//!
//! The broker side (spawning, record routing) lives in the `snakestream` crate.
//! A simulation engine implements [`SimulationEngine`]; [`run_worker`] drives it:
//!
//! 1. Read `Init { config }` from stdin
//! 2. `engine.start(config)` → send `Init { data }`
//! 3. `engine.step()` until the run ends, sending one `Step` per tick
//! 4. Exit on run end, on `Stop` (after replying `Stopping`) or when stdin closes
//!
//! Engine calls run on the blocking pool so stop requests are seen mid-step.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{CodecError, JsonCodec};
use crate::protocol::{ControlRequest, InitRecord, LogLevel, StepRecord, WorkerMessage};
use crate::run_config::RunConfig;

/// Engine failure, reported to the broker as `Fatal`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A simulation the harness can drive.
pub trait SimulationEngine: Send + 'static {
    /// Build the run from the client's configuration and describe it.
    fn start(&mut self, config: &RunConfig) -> Result<InitRecord, EngineError>;

    /// Advance one tick. `None` ends the run.
    fn step(&mut self) -> Result<Option<StepRecord>, EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("control channel closed before init")]
    NoInit,
    #[error("engine task panicked: {0}")]
    Panicked(String),
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The engine reported the end of the run.
    Finished { steps: u64 },
    /// The broker asked the worker to stop.
    Stopped { steps: u64 },
    /// The control channel closed (broker gone).
    ParentGone { steps: u64 },
    /// The engine failed; `Fatal` was sent.
    Failed { reason: String },
}

/// Run the worker protocol over this process's stdin/stdout.
pub async fn run_worker<E: SimulationEngine>(engine: E) -> Result<WorkerExit, WorkerError> {
    run_worker_on(tokio::io::stdin(), tokio::io::stdout(), engine).await
}

/// Run the worker protocol over arbitrary pipes.
pub async fn run_worker_on<R, W, E>(
    reader: R,
    writer: W,
    engine: E,
) -> Result<WorkerExit, WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: SimulationEngine,
{
    let mut control = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let mut out = FramedWrite::new(writer, JsonCodec::<WorkerMessage>::new());

    let config = match control.next().await {
        Some(Ok(ControlRequest::Init { config })) => config,
        Some(Ok(ControlRequest::Stop)) => {
            out.send(WorkerMessage::Stopping).await?;
            return Ok(WorkerExit::Stopped { steps: 0 });
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(WorkerError::NoInit),
    };
    tracing::info!(
        grid_width = config.grid_width,
        grid_height = config.grid_height,
        nr_of_snakes = config.nr_of_snakes,
        "Worker starting run"
    );

    let (mut engine, started) = tokio::task::spawn_blocking(move || {
        let mut engine = engine;
        let started = engine.start(&config);
        (engine, started)
    })
    .await
    .map_err(|e| WorkerError::Panicked(e.to_string()))?;

    match started {
        Ok(init) => out.send(WorkerMessage::Init { data: init }).await?,
        Err(e) => return fail(&mut out, e).await,
    }

    let mut steps: u64 = 0;
    loop {
        let mut task = tokio::task::spawn_blocking(move || {
            let step = engine.step();
            (engine, step)
        });

        let (returned, step) = loop {
            tokio::select! {
                biased;

                msg = control.next() => match msg {
                    Some(Ok(ControlRequest::Stop)) => {
                        tracing::info!(steps, "Stop requested");
                        out.send(WorkerMessage::Stopping).await?;
                        return Ok(WorkerExit::Stopped { steps });
                    }
                    Some(Ok(ControlRequest::Init { .. })) => {
                        tracing::warn!("Ignoring repeated init");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error, exiting");
                        return Ok(WorkerExit::ParentGone { steps });
                    }
                    None => {
                        tracing::info!(steps, "Control channel closed, exiting");
                        return Ok(WorkerExit::ParentGone { steps });
                    }
                },

                joined = &mut task => {
                    break joined.map_err(|e| WorkerError::Panicked(e.to_string()))?;
                }
            }
        };
        engine = returned;

        match step {
            Ok(Some(record)) => {
                out.send(WorkerMessage::Step { data: record }).await?;
                steps += 1;
            }
            Ok(None) => {
                tracing::info!(steps, "Run finished");
                return Ok(WorkerExit::Finished { steps });
            }
            Err(e) => return fail(&mut out, e).await,
        }
    }
}

async fn fail<W: AsyncWrite + Unpin>(
    out: &mut FramedWrite<W, JsonCodec<WorkerMessage>>,
    error: EngineError,
) -> Result<WorkerExit, WorkerError> {
    tracing::error!(error = %error, "Engine failed");
    out.send(WorkerMessage::Log {
        level: LogLevel::Error,
        message: format!("engine failed: {error}"),
    })
    .await?;
    out.send(WorkerMessage::Fatal {
        reason: error.0.clone(),
    })
    .await?;
    Ok(WorkerExit::Failed { reason: error.0 })
}
