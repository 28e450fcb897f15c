//! Worker bridge - one simulation worker per session, exposed as an ordered record stream.
//!
//! Flow:
//! 1. Spawn the worker through a [`WorkerSpawner`]
//! 2. Send `Init { config }` over the worker's stdin
//! 3. A dedicated reader task decodes stdout and queues init/step records
//! 4. The session pulls records with [`WorkerBridge::recv_init`] / [`WorkerBridge::poll_step`]
//! 5. [`WorkerBridge::stop`]: `Stop`, grace period, SIGTERM, then kill
//!
//! Clean exit and crash look the same from here: the record queue closes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use snakestream_bridge::{
    CodecError, ControlRequest, InitRecord, JsonCodec, LogLevel, RunConfig, SimulationEngine,
    StepRecord, WorkerMessage, run_worker_on,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Records buffered between the reader task and the session.
const RECORD_QUEUE: usize = 256;

/// How long a worker gets to exit after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// In-memory pipe capacity for in-process workers.
const TASK_PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} not captured")]
    Stdio(&'static str),
    #[error("failed to send init to worker: {0}")]
    Send(#[source] CodecError),
    #[error(transparent)]
    Init(#[from] BridgeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("worker sent no init record within {0:?}")]
    InitTimeout(Duration),
    #[error("worker channel closed before init")]
    Closed,
    #[error("worker protocol error: {0}")]
    Protocol(String),
}

/// Result of a bounded wait for the next step.
#[derive(Debug)]
pub enum StepPoll {
    Step(StepRecord),
    /// Nothing arrived within the timeout.
    Idle,
    /// The worker's channel is closed; no more records will arrive.
    EndOfStream,
}

/// How [`WorkerBridge::stop`] ended the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period.
    Exited,
    /// Exited after SIGTERM.
    Terminated,
    /// Forcibly killed.
    Killed,
    /// `stop` had already run.
    AlreadyStopped,
}

/// Handle on a running worker, process or task.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, if the worker is a process.
    fn pid(&self) -> Option<u32>;

    fn has_exited(&mut self) -> bool;

    async fn wait_exit(&mut self);

    /// Ask the worker to terminate (SIGTERM). Returns false if that is not possible.
    fn terminate(&mut self) -> bool;

    async fn force_kill(&mut self);
}

#[async_trait]
impl WorkerProcess for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }

    async fn wait_exit(&mut self) {
        if let Err(e) = Child::wait(self).await {
            tracing::warn!(error = %e, "Failed to wait for worker");
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.id().and_then(|pid| i32::try_from(pid).ok()) else {
            return false;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(worker_pid = pid, error = %e, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        false
    }

    async fn force_kill(&mut self) {
        if let Err(e) = Child::kill(self).await {
            tracing::warn!(error = %e, "Failed to kill worker");
        }
    }
}

/// An in-process worker running on a tokio task.
pub struct TaskWorker {
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl WorkerProcess for TaskWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    async fn wait_exit(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
    }

    fn terminate(&mut self) -> bool {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
        true
    }

    async fn force_kill(&mut self) {
        self.terminate();
        self.wait_exit().await;
    }
}

impl Drop for TaskWorker {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// A freshly spawned worker and its stdio.
pub struct SpawnedWorker {
    pub process: Box<dyn WorkerProcess>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &RunConfig) -> Result<SpawnedWorker, SpawnError>;
}

/// Runs a configured program as the worker process.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, _config: &RunConfig) -> Result<SpawnedWorker, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(SpawnError::Stdio("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Stdio("stdout"))?;
        tracing::debug!(program = %self.program, worker_pid = ?child.id(), "Spawned worker process");

        Ok(SpawnedWorker {
            process: Box::new(child),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }
}

/// Runs a [`SimulationEngine`] on a tokio task, speaking the worker protocol over
/// in-memory pipes. A fresh engine is built per session.
pub struct TaskSpawner<F> {
    factory: F,
}

impl<F, E> TaskSpawner<F>
where
    F: Fn() -> E + Send + Sync,
    E: SimulationEngine,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

impl<F, E> WorkerSpawner for TaskSpawner<F>
where
    F: Fn() -> E + Send + Sync,
    E: SimulationEngine,
{
    fn spawn(&self, _config: &RunConfig) -> Result<SpawnedWorker, SpawnError> {
        let (broker, worker) = tokio::io::duplex(TASK_PIPE_CAPACITY);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (broker_read, broker_write) = tokio::io::split(broker);

        let engine = (self.factory)();
        let handle = tokio::spawn(async move {
            match run_worker_on(worker_read, worker_write, engine).await {
                Ok(exit) => tracing::debug!(?exit, "In-process worker exited"),
                Err(e) => tracing::warn!(error = %e, "In-process worker failed"),
            }
        });

        Ok(SpawnedWorker {
            process: Box::new(TaskWorker {
                handle: Some(handle),
            }),
            stdin: Box::new(broker_write),
            stdout: Box::new(broker_read),
        })
    }
}

enum WorkerRecord {
    Init(InitRecord),
    Step(StepRecord),
}

type ControlWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<ControlRequest>>;

/// One session's worker.
pub struct WorkerBridge {
    process: Box<dyn WorkerProcess>,
    control: ControlWriter,
    records: mpsc::Receiver<WorkerRecord>,
    reader: JoinHandle<()>,
    pid: Option<u32>,
    exhausted: bool,
    stopped: bool,
}

impl WorkerBridge {
    /// Spawn a worker and hand it the run configuration.
    pub async fn start(
        spawner: &dyn WorkerSpawner,
        config: &RunConfig,
    ) -> Result<Self, SpawnError> {
        let SpawnedWorker {
            process,
            stdin,
            stdout,
        } = spawner.spawn(config)?;
        let pid = process.pid();

        let (tx, records) = mpsc::channel(RECORD_QUEUE);
        let reader = tokio::spawn(read_records(
            FramedRead::new(stdout, JsonCodec::<WorkerMessage>::new()),
            tx,
            pid,
        ));

        let mut bridge = Self {
            process,
            control: FramedWrite::new(stdin, JsonCodec::new()),
            records,
            reader,
            pid,
            exhausted: false,
            stopped: false,
        };

        tracing::debug!(worker_pid = ?pid, "Sending Init to worker");
        if let Err(e) = bridge
            .control
            .send(ControlRequest::Init {
                config: config.clone(),
            })
            .await
        {
            bridge.abort().await;
            return Err(SpawnError::Send(e));
        }

        Ok(bridge)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the worker's init record.
    pub async fn recv_init(&mut self, timeout: Duration) -> Result<InitRecord, BridgeError> {
        match tokio::time::timeout(timeout, self.records.recv()).await {
            Err(_) => Err(BridgeError::InitTimeout(timeout)),
            Ok(None) => {
                self.exhausted = true;
                Err(BridgeError::Closed)
            }
            Ok(Some(WorkerRecord::Init(init))) => Ok(init),
            Ok(Some(WorkerRecord::Step(_))) => {
                Err(BridgeError::Protocol("step record before init".to_string()))
            }
        }
    }

    /// Wait up to `timeout` for the next step record. Cancel-safe.
    pub async fn poll_step(&mut self, timeout: Duration) -> StepPoll {
        if self.exhausted {
            return StepPoll::EndOfStream;
        }
        match tokio::time::timeout(timeout, self.records.recv()).await {
            Err(_) => StepPoll::Idle,
            Ok(None) => {
                self.exhausted = true;
                StepPoll::EndOfStream
            }
            Ok(Some(WorkerRecord::Step(step))) => StepPoll::Step(step),
            Ok(Some(WorkerRecord::Init(_))) => {
                tracing::warn!(worker_pid = ?self.pid, "Ignoring repeated init record");
                StepPoll::Idle
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        !self.stopped && !self.process.has_exited()
    }

    /// Stop the worker: `Stop`, wait `grace`, SIGTERM, short wait, kill.
    ///
    /// Records still arriving are discarded throughout, so a worker blocked on a
    /// full output pipe gets to read `Stop`.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        if self.stopped {
            return StopOutcome::AlreadyStopped;
        }
        self.stopped = true;

        let outcome = if self.process.has_exited() {
            StopOutcome::Exited
        } else {
            let send = self.control.send(ControlRequest::Stop);
            match tokio::time::timeout(grace, discard_records(&mut self.records, send)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(worker_pid = ?self.pid, error = %e, "Stop not delivered"),
                Err(_) => tracing::debug!(worker_pid = ?self.pid, "Stop write timed out"),
            }

            let exited = discard_records(&mut self.records, self.process.wait_exit());
            if tokio::time::timeout(grace, exited).await.is_ok() {
                StopOutcome::Exited
            } else if self.process.terminate()
                && tokio::time::timeout(
                    TERM_GRACE,
                    discard_records(&mut self.records, self.process.wait_exit()),
                )
                .await
                .is_ok()
            {
                StopOutcome::Terminated
            } else {
                self.process.force_kill().await;
                StopOutcome::Killed
            }
        };

        self.reader.abort();
        match outcome {
            StopOutcome::Exited => tracing::debug!(worker_pid = ?self.pid, "Worker exited"),
            other => tracing::warn!(worker_pid = ?self.pid, outcome = ?other, "Worker did not exit in time"),
        }
        outcome
    }

    async fn abort(&mut self) {
        self.stopped = true;
        self.reader.abort();
        self.process.force_kill().await;
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!(worker_pid = ?self.pid, "Worker bridge dropped without stop");
            self.reader.abort();
        }
    }
}

/// Drive `fut` to completion while dropping whatever the worker still sends.
async fn discard_records<F: Future>(
    records: &mut mpsc::Receiver<WorkerRecord>,
    fut: F,
) -> F::Output {
    tokio::pin!(fut);
    let mut open = true;
    loop {
        tokio::select! {
            biased;

            output = &mut fut => return output,
            record = records.recv(), if open => open = record.is_some(),
        }
    }
}

async fn read_records<R>(
    mut reader: FramedRead<R, JsonCodec<WorkerMessage>>,
    tx: mpsc::Sender<WorkerRecord>,
    pid: Option<u32>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let record = match reader.next().await {
            Some(Ok(WorkerMessage::Init { data })) => WorkerRecord::Init(data),
            Some(Ok(WorkerMessage::Step { data })) => WorkerRecord::Step(data),
            Some(Ok(WorkerMessage::Log { level, message })) => {
                emit_worker_log(level, pid, &message);
                continue;
            }
            Some(Ok(WorkerMessage::Fatal { reason })) => {
                tracing::error!(worker_pid = ?pid, %reason, "Worker fatal");
                break;
            }
            Some(Ok(WorkerMessage::Stopping)) => {
                tracing::debug!(worker_pid = ?pid, "Worker acknowledged stop");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(worker_pid = ?pid, error = %e, "Worker channel error");
                break;
            }
            None => {
                tracing::debug!(worker_pid = ?pid, "Worker channel closed");
                break;
            }
        };
        if tx.send(record).await.is_err() {
            break;
        }
    }
    tracing::trace!(worker_pid = ?pid, "Worker reader task exiting");
}

fn emit_worker_log(level: LogLevel, pid: Option<u32>, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(target: "snakestream::worker", worker_pid = ?pid, "{message}"),
        LogLevel::Debug => tracing::debug!(target: "snakestream::worker", worker_pid = ?pid, "{message}"),
        LogLevel::Info => tracing::info!(target: "snakestream::worker", worker_pid = ?pid, "{message}"),
        LogLevel::Warn => tracing::warn!(target: "snakestream::worker", worker_pid = ?pid, "{message}"),
        LogLevel::Error => tracing::error!(target: "snakestream::worker", worker_pid = ?pid, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snakestream_bridge::EngineError;

    const WAIT: Duration = Duration::from_secs(5);

    struct Ticker {
        remaining: Option<u32>,
        tick: u32,
    }

    impl Ticker {
        fn finite(steps: u32) -> Self {
            Self {
                remaining: Some(steps),
                tick: 0,
            }
        }

        fn endless() -> Self {
            Self {
                remaining: None,
                tick: 0,
            }
        }
    }

    impl SimulationEngine for Ticker {
        fn start(&mut self, config: &RunConfig) -> Result<InitRecord, EngineError> {
            Ok(InitRecord(json!({"width": config.grid_width})))
        }

        fn step(&mut self) -> Result<Option<StepRecord>, EngineError> {
            match &mut self.remaining {
                Some(0) => return Ok(None),
                Some(n) => *n -= 1,
                None => std::thread::sleep(Duration::from_millis(5)),
            }
            self.tick += 1;
            Ok(Some(StepRecord(json!({"tick": self.tick}))))
        }
    }

    async fn collect_steps(bridge: &mut WorkerBridge) -> Vec<serde_json::Value> {
        let mut steps = Vec::new();
        loop {
            match bridge.poll_step(WAIT).await {
                StepPoll::Step(step) => steps.push(step.0),
                StepPoll::Idle => panic!("worker went idle"),
                StepPoll::EndOfStream => return steps,
            }
        }
    }

    #[tokio::test]
    async fn task_worker_streams_init_then_steps() {
        let spawner = TaskSpawner::new(|| Ticker::finite(3));
        let config = RunConfig::default().with_data_on_demand(true);
        let mut bridge = WorkerBridge::start(&spawner, &config).await.unwrap();

        let init = bridge.recv_init(WAIT).await.unwrap();
        assert_eq!(init.as_value(), &json!({"width": 32}));

        let steps = collect_steps(&mut bridge).await;
        assert_eq!(
            steps,
            vec![json!({"tick": 1}), json!({"tick": 2}), json!({"tick": 3})]
        );
        assert!(matches!(bridge.poll_step(WAIT).await, StepPoll::EndOfStream));

        assert_eq!(bridge.stop(WAIT).await, StopOutcome::Exited);
        assert_eq!(bridge.stop(WAIT).await, StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn stop_ends_endless_task_worker() {
        let spawner = TaskSpawner::new(Ticker::endless);
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        bridge.recv_init(WAIT).await.unwrap();
        assert!(matches!(bridge.poll_step(WAIT).await, StepPoll::Step(_)));
        assert!(bridge.is_alive());

        assert_eq!(bridge.stop(WAIT).await, StopOutcome::Exited);
        assert!(!bridge.is_alive());
    }

    #[tokio::test]
    async fn stop_reaches_worker_blocked_on_output() {
        struct Firehose(u64);
        impl SimulationEngine for Firehose {
            fn start(&mut self, _: &RunConfig) -> Result<InitRecord, EngineError> {
                Ok(InitRecord(json!({})))
            }
            fn step(&mut self) -> Result<Option<StepRecord>, EngineError> {
                self.0 += 1;
                Ok(Some(StepRecord(json!({"tick": self.0, "pad": "x".repeat(64)}))))
            }
        }

        let spawner = TaskSpawner::new(|| Firehose(0));
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        bridge.recv_init(WAIT).await.unwrap();

        // Nobody polls: the record queue and the pipe fill up.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            bridge.stop(Duration::from_millis(500)).await,
            StopOutcome::Exited
        );
    }

    #[tokio::test]
    async fn engine_failure_ends_stream() {
        struct Broken;
        impl SimulationEngine for Broken {
            fn start(&mut self, _: &RunConfig) -> Result<InitRecord, EngineError> {
                Ok(InitRecord(json!({})))
            }
            fn step(&mut self) -> Result<Option<StepRecord>, EngineError> {
                Err(EngineError::new("collision table corrupt"))
            }
        }

        let spawner = TaskSpawner::new(|| Broken);
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        bridge.recv_init(WAIT).await.unwrap();
        assert!(collect_steps(&mut bridge).await.is_empty());
        bridge.stop(WAIT).await;
    }

    #[tokio::test]
    async fn failed_start_closes_before_init() {
        struct NoStart;
        impl SimulationEngine for NoStart {
            fn start(&mut self, _: &RunConfig) -> Result<InitRecord, EngineError> {
                Err(EngineError::new("grid too small"))
            }
            fn step(&mut self) -> Result<Option<StepRecord>, EngineError> {
                Ok(None)
            }
        }

        let spawner = TaskSpawner::new(|| NoStart);
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        assert_eq!(bridge.recv_init(WAIT).await, Err(BridgeError::Closed));
        assert!(matches!(bridge.poll_step(WAIT).await, StepPoll::EndOfStream));
        bridge.stop(WAIT).await;
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/snakestream-worker");
        let result = WorkerBridge::start(&spawner, &RunConfig::default()).await;
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_process_times_out_then_terminates() {
        let spawner = CommandSpawner::new("sleep").with_args(["30"]);
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        assert!(bridge.pid().is_some());

        let timeout = Duration::from_millis(100);
        assert_eq!(
            bridge.recv_init(timeout).await,
            Err(BridgeError::InitTimeout(timeout))
        );
        assert!(bridge.is_alive());

        assert_eq!(
            bridge.stop(Duration::from_millis(50)).await,
            StopOutcome::Terminated
        );
        assert!(!bridge.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_ignoring_sigterm_is_killed() {
        let spawner = CommandSpawner::new("sh").with_args(["-c", "trap '' TERM; sleep 5"]);
        let mut bridge = WorkerBridge::start(&spawner, &RunConfig::default())
            .await
            .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            bridge.stop(Duration::from_millis(50)).await,
            StopOutcome::Killed
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exiting_process_closes_before_init() {
        let spawner = CommandSpawner::new("true");
        match WorkerBridge::start(&spawner, &RunConfig::default()).await {
            Ok(mut bridge) => {
                assert_eq!(bridge.recv_init(WAIT).await, Err(BridgeError::Closed));
                bridge.stop(WAIT).await;
            }
            // init may hit a closed pipe if the process is already gone
            Err(SpawnError::Send(_)) => {}
            Err(other) => panic!("unexpected spawn error: {other}"),
        }
    }
}
