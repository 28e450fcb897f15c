//! Session - one client connection paired with one simulation worker.
//!
//! Phases: `ADMITTED → HANDSHAKING → STREAMING → DRAINING → CLOSED`.
//!
//! 1. HANDSHAKING: read the run config, send `ACK`, start the worker, forward its init record
//! 2. STREAMING: relay step records through the frame pipeline into the flow broker
//! 3. DRAINING: close the buffer and let the delivery task flush it
//! 4. CLOSED: `END`, close, stop the worker, release the admission slot
//!
//! Teardown runs exactly once on every path.

use std::time::Duration;

use snakestream_bridge::{DataMode, RunConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{SessionId, SessionPermit};
use crate::encoder::{EncoderError, PixelSettings};
use crate::flow::{CreditGate, DEFAULT_PUSH_INTERVAL, DeliveryMode, FlowBroker, FlowError};
use crate::frame::FramePipeline;
use crate::transport::{ClientSink, ClientStream, InboundMessage, OutboundMessage};
use crate::worker_bridge::{SpawnError, StepPoll, WorkerBridge, WorkerSpawner};

/// Sent after a valid run config.
pub const ACK: &str = "ACK";

/// Sent immediately before the server closes the connection.
pub const END: &str = "END";

/// Idle polls tolerated after the worker process has exited.
const DEAD_WORKER_GRACE_POLLS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Admitted,
    Handshaking,
    Streaming,
    Draining,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "ADMITTED",
            Self::Handshaking => "HANDSHAKING",
            Self::Streaming => "STREAMING",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("no run config received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("cannot encode pixels: {0}")]
    Encoder(#[from] EncoderError),
    #[error("server shutting down")]
    Shutdown,
}

/// Why a session that reached STREAMING ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The worker's channel closed: run finished or worker died.
    WorkerChannelClosed,
    ClientDisconnected,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub data_mode: DataMode,
    pub steps_received: u64,
    pub frames_delivered: u64,
    pub end: SessionEnd,
}

/// Per-session timings and rendering settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub init_timeout: Duration,
    pub poll_timeout: Duration,
    pub push_interval: Duration,
    pub stop_grace: Duration,
    pub pixels: PixelSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(100),
            push_interval: DEFAULT_PUSH_INTERVAL,
            stop_grace: Duration::from_secs(2),
            pixels: PixelSettings::default(),
        }
    }
}

impl SessionSettings {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_pixels(mut self, pixels: PixelSettings) -> Self {
        self.pixels = pixels;
        self
    }
}

/// Parse a `GET <n>` credit request. `n` must be a positive integer; counts
/// beyond `u32::MAX` saturate.
pub fn parse_credit_request(text: &str) -> Result<u32, String> {
    let mut parts = text.split_whitespace();
    let (Some("GET"), Some(count), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected `GET <n>`, got {text:?}"));
    };
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid credit count {count:?}"));
    }
    match count.trim_start_matches('0') {
        "" => Err(format!("invalid credit count {count:?}")),
        digits => Ok(digits.parse::<u32>().unwrap_or(u32::MAX)),
    }
}

/// How the inbound reader task ended.
#[derive(Debug)]
enum InboundEnd {
    Disconnected,
    Violation(String),
    Cancelled,
}

enum RelayEnd {
    WorkerChannelClosed,
    DeliveryStopped,
    Cancelled,
}

/// One admitted client connection.
pub struct Session<S, R> {
    id: SessionId,
    permit: SessionPermit,
    settings: SessionSettings,
    phase: SessionPhase,
    sink: Option<S>,
    stream: Option<R>,
    bridge: Option<WorkerBridge>,
    inbound: Option<JoinHandle<InboundEnd>>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    data_mode: DataMode,
    client_gone: bool,
    steps_received: u64,
    frames_delivered: u64,
}

impl<S: ClientSink, R: ClientStream> Session<S, R> {
    pub fn new(
        permit: SessionPermit,
        sink: S,
        stream: R,
        settings: SessionSettings,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            id: permit.id(),
            permit,
            settings,
            phase: SessionPhase::Admitted,
            sink: Some(sink),
            stream: Some(stream),
            bridge: None,
            inbound: None,
            shutdown: shutdown.clone(),
            cancel: shutdown.child_token(),
            data_mode: DataMode::default(),
            client_gone: false,
            steps_received: 0,
            frames_delivered: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Drive the session to completion. Always tears down before returning.
    pub async fn run(&mut self, spawner: &dyn WorkerSpawner) -> Result<SessionSummary, SessionError> {
        let result = self.drive(spawner).await;
        if matches!(
            result,
            Ok(SessionEnd::ClientDisconnected) | Err(SessionError::ClientDisconnected)
        ) {
            self.client_gone = true;
        }
        self.teardown().await;

        match result {
            Ok(end) => {
                let summary = SessionSummary {
                    id: self.id,
                    data_mode: self.data_mode,
                    steps_received: self.steps_received,
                    frames_delivered: self.frames_delivered,
                    end,
                };
                tracing::info!(
                    session_id = %self.id,
                    steps = summary.steps_received,
                    frames = summary.frames_delivered,
                    end = ?summary.end,
                    "Session finished"
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Session failed");
                Err(e)
            }
        }
    }

    /// Send `END` if the client can still hear it, close the connection, stop the
    /// worker and release the admission slot. Later calls do nothing.
    pub async fn teardown(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }
        self.transition(SessionPhase::Closed);
        self.cancel.cancel();

        if let Some(sink) = self.sink.as_mut() {
            if !self.client_gone
                && let Err(e) = sink.send(OutboundMessage::text(END)).await
            {
                tracing::debug!(session_id = %self.id, error = %e, "Could not send END");
            }
            if let Err(e) = sink.close().await {
                tracing::debug!(session_id = %self.id, error = %e, "Close failed");
            }
        }
        self.stream = None;
        if let Some(inbound) = self.inbound.take() {
            inbound.abort();
        }

        if let Some(bridge) = self.bridge.as_mut() {
            let outcome = bridge.stop(self.settings.stop_grace).await;
            tracing::debug!(session_id = %self.id, ?outcome, "Worker stopped");
        }

        self.permit.release();
    }

    fn transition(&mut self, next: SessionPhase) {
        tracing::info!(session_id = %self.id, from = %self.phase, to = %next, "Session phase");
        self.phase = next;
    }

    async fn drive(&mut self, spawner: &dyn WorkerSpawner) -> Result<SessionEnd, SessionError> {
        self.transition(SessionPhase::Handshaking);

        let config = self.read_config().await?;
        self.data_mode = config.data_mode;
        self.permit.controller().set_data_mode(self.id, config.data_mode);
        self.send(OutboundMessage::text(ACK)).await?;

        let bridge = self.bridge.insert(WorkerBridge::start(spawner, &config).await?);
        tracing::info!(
            session_id = %self.id,
            worker_pid = ?bridge.pid(),
            data_mode = %config.data_mode,
            on_demand = config.data_on_demand,
            "Worker started"
        );
        let init = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Shutdown),
            init = bridge.recv_init(self.settings.init_timeout) => init.map_err(SpawnError::from)?,
        };

        let pipeline = FramePipeline::new(config.data_mode, &init, &self.settings.pixels)?;
        self.send(OutboundMessage::Text(init.as_value().to_string()))
            .await?;

        let (Some(sink), Some(stream)) = (self.sink.take(), self.stream.take()) else {
            return Err(SessionError::ClientDisconnected);
        };
        let mode = DeliveryMode::for_config(&config, self.settings.push_interval);
        let flow = FlowBroker::start(mode, sink, self.cancel.clone());
        let credit = config.data_on_demand.then(|| flow.credit());
        self.inbound = Some(tokio::spawn(read_client(
            stream,
            credit,
            self.cancel.clone(),
            self.id,
        )));

        self.transition(SessionPhase::Streaming);
        let relay_end = match self.bridge.as_mut() {
            Some(bridge) => {
                relay(
                    bridge,
                    &flow,
                    pipeline,
                    &self.cancel,
                    self.settings.poll_timeout,
                    &mut self.steps_received,
                )
                .await
            }
            None => RelayEnd::WorkerChannelClosed,
        };

        self.transition(SessionPhase::Draining);
        let delivery = flow.finish().await;
        let flow_result = match delivery {
            Ok(outcome) => {
                self.sink = Some(outcome.sink);
                self.frames_delivered = outcome.delivered;
                outcome.result
            }
            Err(e) => Err(e),
        };

        match (relay_end, flow_result) {
            (_, Err(FlowError::ClientDisconnected(_))) | (RelayEnd::DeliveryStopped, Ok(())) => {
                Ok(SessionEnd::ClientDisconnected)
            }
            (RelayEnd::Cancelled, _) | (_, Err(FlowError::Cancelled)) => {
                self.cancellation_cause().await
            }
            (RelayEnd::WorkerChannelClosed, Ok(())) => Ok(SessionEnd::WorkerChannelClosed),
            (_, Err(e)) => {
                tracing::error!(session_id = %self.id, error = %e, "Delivery failed");
                Ok(SessionEnd::WorkerChannelClosed)
            }
        }
    }

    async fn read_config(&mut self) -> Result<RunConfig, SessionError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(SessionError::ClientDisconnected);
        };
        let timeout = self.settings.handshake_timeout;
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Shutdown),
            received = tokio::time::timeout(timeout, stream.recv()) => received,
        };

        let payload = match received {
            Err(_) => return Err(SessionError::HandshakeTimeout(timeout)),
            Ok(None | Some(Ok(InboundMessage::Close))) => {
                return Err(SessionError::ClientDisconnected);
            }
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %self.id, error = %e, "Handshake read failed");
                return Err(SessionError::ClientDisconnected);
            }
            Ok(Some(Ok(InboundMessage::Text(text)))) => text.into_bytes(),
            Ok(Some(Ok(InboundMessage::Binary(bytes)))) => bytes.to_vec(),
        };

        RunConfig::from_json(&payload).map_err(|e| SessionError::ProtocolViolation(e.to_string()))
    }

    async fn send(&mut self, message: OutboundMessage) -> Result<(), SessionError> {
        let sink = self.sink.as_mut().ok_or(SessionError::ClientDisconnected)?;
        sink.send(message).await.map_err(|e| {
            tracing::debug!(session_id = %self.id, error = %e, "Send failed");
            SessionError::ClientDisconnected
        })
    }

    /// The session token was cancelled: by server shutdown or by the inbound reader.
    async fn cancellation_cause(&mut self) -> Result<SessionEnd, SessionError> {
        if self.shutdown.is_cancelled() {
            return Ok(SessionEnd::Shutdown);
        }
        let Some(inbound) = self.inbound.take() else {
            return Ok(SessionEnd::ClientDisconnected);
        };
        match inbound.await {
            Ok(InboundEnd::Violation(reason)) => Err(SessionError::ProtocolViolation(reason)),
            Ok(InboundEnd::Disconnected) => Ok(SessionEnd::ClientDisconnected),
            Ok(InboundEnd::Cancelled) => Ok(SessionEnd::Shutdown),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Inbound task failed");
                Ok(SessionEnd::ClientDisconnected)
            }
        }
    }
}

async fn relay<S: ClientSink>(
    bridge: &mut WorkerBridge,
    flow: &FlowBroker<S>,
    mut pipeline: FramePipeline,
    cancel: &CancellationToken,
    poll_timeout: Duration,
    steps_received: &mut u64,
) -> RelayEnd {
    let mut dead_polls: u32 = 0;
    loop {
        if !flow.is_delivering() {
            return RelayEnd::DeliveryStopped;
        }

        let poll = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayEnd::Cancelled,
            poll = bridge.poll_step(poll_timeout) => poll,
        };

        match poll {
            StepPoll::Step(step) => {
                *steps_received += 1;
                dead_polls = 0;
                for frame in pipeline.frames(step) {
                    if flow.push(frame).is_err() {
                        return RelayEnd::DeliveryStopped;
                    }
                }
            }
            StepPoll::Idle => {
                if !bridge.is_alive() {
                    if dead_polls >= DEAD_WORKER_GRACE_POLLS {
                        tracing::warn!(worker_pid = ?bridge.pid(), "Worker exited with its channel still open");
                        return RelayEnd::WorkerChannelClosed;
                    }
                    dead_polls += 1;
                }
            }
            StepPoll::EndOfStream => {
                tracing::debug!(steps = *steps_received, "Worker stream ended");
                return RelayEnd::WorkerChannelClosed;
            }
        }
    }
}

async fn read_client<R: ClientStream>(
    mut stream: R,
    credit: Option<CreditGate>,
    cancel: CancellationToken,
    session_id: SessionId,
) -> InboundEnd {
    let end = loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break InboundEnd::Cancelled,
            received = stream.recv() => received,
        };

        match received {
            None | Some(Ok(InboundMessage::Close)) => break InboundEnd::Disconnected,
            Some(Err(e)) => {
                tracing::debug!(%session_id, error = %e, "Client read failed");
                break InboundEnd::Disconnected;
            }
            Some(Ok(InboundMessage::Text(text))) => match &credit {
                Some(credit) => match parse_credit_request(&text) {
                    Ok(n) => credit.grant(n),
                    Err(reason) => break InboundEnd::Violation(reason),
                },
                None => tracing::debug!(%session_id, "Ignoring client message in timed mode"),
            },
            Some(Ok(InboundMessage::Binary(_))) => {
                if credit.is_some() {
                    break InboundEnd::Violation("binary message where credit request expected".to_string());
                }
                tracing::debug!(%session_id, "Ignoring binary client message in timed mode");
            }
        }
    };

    if !matches!(end, InboundEnd::Cancelled) {
        tracing::debug!(%session_id, ?end, "Inbound reader ending session");
        cancel.cancel();
    }
    end
}
