//! Flow-control broker - FIFO buffer between the relay loop and the client.
//!
//! The relay loop pushes frames; a single delivery task drains them to the client
//! either on a fixed cadence or against client-granted credit. The delivery task owns
//! the client sink for the session's streaming phase and hands it back on finish.

use std::sync::Arc;
use std::time::Duration;

use snakestream_bridge::RunConfig;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::Frame;
use crate::transport::{ClientSink, TransportError};

/// Default cadence for timed delivery.
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Shortest timed cadence; a zero interval would never yield.
const MIN_PUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver at most one frame per `interval`.
    Timed { interval: Duration },
    /// Deliver one frame per unit of client credit.
    OnDemand,
}

impl DeliveryMode {
    pub fn for_config(config: &RunConfig, push_interval: Duration) -> Self {
        if config.data_on_demand {
            Self::OnDemand
        } else {
            Self::Timed {
                interval: push_interval,
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("client disconnected: {0}")]
    ClientDisconnected(#[source] TransportError),
    #[error("delivery cancelled")]
    Cancelled,
    #[error("flow broker is closed")]
    Closed,
    #[error("delivery task failed: {0}")]
    Task(String),
}

/// Client credit, additive and saturating. Only the delivery task consumes it.
#[derive(Debug, Clone)]
pub struct CreditGate {
    permits: Arc<Semaphore>,
}

impl Default for CreditGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CreditGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
        }
    }

    /// Add `n` frames of credit.
    pub fn grant(&self, n: u32) {
        let room = Semaphore::MAX_PERMITS - self.permits.available_permits();
        let added = (n as usize).min(room);
        self.permits.add_permits(added);
        tracing::trace!(granted = n, available = self.available(), "Credit granted");
    }

    /// Wait for one unit of credit and consume it.
    pub async fn take(&self) {
        match self.permits.acquire().await {
            Ok(permit) => permit.forget(),
            // never closed
            Err(_) => std::future::pending::<()>().await,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// What the delivery task hands back.
pub struct DeliveryOutcome<S> {
    pub sink: S,
    pub delivered: u64,
    pub result: Result<(), FlowError>,
}

/// Buffer plus delivery task for one session.
pub struct FlowBroker<S> {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    task: JoinHandle<DeliveryOutcome<S>>,
    credit: CreditGate,
}

impl<S: ClientSink> FlowBroker<S> {
    /// Start the delivery task. It exits when the buffer is drained after
    /// [`finish`](Self::finish), on `cancel`, or on the first failed send.
    pub fn start(mode: DeliveryMode, sink: S, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = CreditGate::new();
        let task = tokio::spawn(deliver(mode, sink, rx, credit.clone(), cancel));
        Self {
            tx: Some(tx),
            task,
            credit,
        }
    }

    pub fn credit(&self) -> CreditGate {
        self.credit.clone()
    }

    /// Enqueue a frame. Never blocks.
    pub fn push(&self, frame: Frame) -> Result<(), FlowError> {
        let tx = self.tx.as_ref().ok_or(FlowError::Closed)?;
        tx.send(frame).map_err(|_| FlowError::Closed)
    }

    /// False once the delivery task has ended (send failure or cancellation).
    pub fn is_delivering(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the buffer and wait for the delivery task to drain it.
    pub async fn finish(mut self) -> Result<DeliveryOutcome<S>, FlowError> {
        self.tx = None;
        (&mut self.task)
            .await
            .map_err(|e| FlowError::Task(e.to_string()))
    }
}

async fn deliver<S: ClientSink>(
    mode: DeliveryMode,
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    credit: CreditGate,
    cancel: CancellationToken,
) -> DeliveryOutcome<S> {
    let mut ticker = match mode {
        DeliveryMode::Timed { interval } => {
            let mut ticker = tokio::time::interval(interval.max(MIN_PUSH_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
        DeliveryMode::OnDemand => None,
    };

    let mut delivered: u64 = 0;
    let result = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(FlowError::Cancelled),
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break Ok(());
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(FlowError::Cancelled),
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => credit.take().await,
                }
            } => {}
        }

        if let Err(e) = sink.send(frame.into_message()).await {
            tracing::debug!(error = %e, delivered, "Frame send failed");
            break Err(FlowError::ClientDisconnected(e));
        }
        delivered += 1;
    };

    match &result {
        Ok(()) => tracing::debug!(delivered, "Delivery drained"),
        Err(e) => tracing::debug!(delivered, error = %e, "Delivery stopped"),
    }
    DeliveryOutcome {
        sink,
        delivered,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use snakestream_bridge::StepRecord;
    use tokio::time::Instant;

    use crate::transport::OutboundMessage;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<(Instant, OutboundMessage)>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ClientSink for RecordingSink {
        async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
            if self.fail_after.is_some_and(|n| self.sent.len() >= n) {
                return Err(TransportError::Closed);
            }
            self.sent.push((Instant::now(), message));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn step(n: u64) -> Frame {
        Frame::Step(StepRecord(json!({"step": n})))
    }

    fn texts(sink: &RecordingSink) -> Vec<String> {
        sink.sent
            .iter()
            .map(|(_, m)| m.as_text().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn timed_delivery_is_ordered_and_paced() {
        let interval = Duration::from_millis(50);
        let broker = FlowBroker::start(
            DeliveryMode::Timed { interval },
            RecordingSink::default(),
            CancellationToken::new(),
        );
        for n in 1..=4 {
            broker.push(step(n)).unwrap();
        }

        let outcome = broker.finish().await.unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.delivered, 4);
        assert_eq!(
            texts(&outcome.sink),
            vec![
                r#"{"step":1}"#,
                r#"{"step":2}"#,
                r#"{"step":3}"#,
                r#"{"step":4}"#
            ]
        );
        for pair in outcome.sink.sent.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn late_frame_after_idle_does_not_burst() {
        let interval = Duration::from_millis(50);
        let broker = FlowBroker::start(
            DeliveryMode::Timed { interval },
            RecordingSink::default(),
            CancellationToken::new(),
        );
        broker.push(step(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        broker.push(step(2)).unwrap();
        broker.push(step(3)).unwrap();

        let outcome = broker.finish().await.unwrap();
        let sent = &outcome.sink.sent;
        assert_eq!(sent.len(), 3);
        assert!(sent[2].0 - sent[1].0 >= interval);
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_waits_for_credit() {
        let broker = FlowBroker::start(
            DeliveryMode::OnDemand,
            RecordingSink::default(),
            CancellationToken::new(),
        );
        let credit = broker.credit();
        for n in 1..=10 {
            broker.push(step(n)).unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(broker.is_delivering());

        credit.grant(3);
        credit.grant(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(credit.available(), 0);

        credit.grant(5);
        let outcome = broker.finish().await.unwrap();
        assert_eq!(outcome.delivered, 10);
        assert_eq!(texts(&outcome.sink)[4], r#"{"step":5}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn credit_conservation() {
        let cancel = CancellationToken::new();
        let broker = FlowBroker::start(
            DeliveryMode::OnDemand,
            RecordingSink::default(),
            cancel.clone(),
        );
        let credit = broker.credit();
        for n in 1..=8 {
            broker.push(step(n)).unwrap();
        }
        credit.grant(3);
        credit.grant(2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        let outcome = broker.finish().await.unwrap();
        assert!(matches!(outcome.result, Err(FlowError::Cancelled)));
        assert_eq!(outcome.delivered, 5);
    }

    #[tokio::test]
    async fn cancel_unblocks_credit_wait() {
        let cancel = CancellationToken::new();
        let broker = FlowBroker::start(
            DeliveryMode::OnDemand,
            RecordingSink::default(),
            cancel.clone(),
        );
        broker.push(step(1)).unwrap();

        cancel.cancel();
        let outcome = broker.finish().await.unwrap();
        assert!(matches!(outcome.result, Err(FlowError::Cancelled)));
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_stops_delivery() {
        let sink = RecordingSink {
            fail_after: Some(2),
            ..Default::default()
        };
        let broker = FlowBroker::start(
            DeliveryMode::Timed {
                interval: Duration::from_millis(10),
            },
            sink,
            CancellationToken::new(),
        );
        for n in 1..=5 {
            broker.push(step(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!broker.is_delivering());

        let outcome = broker.finish().await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert!(matches!(
            outcome.result,
            Err(FlowError::ClientDisconnected(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn finish_drains_credited_frames() {
        let broker = FlowBroker::start(
            DeliveryMode::OnDemand,
            RecordingSink::default(),
            CancellationToken::new(),
        );
        broker.credit().grant(1);
        broker.push(step(1)).unwrap();
        let outcome = broker.finish().await.unwrap();
        assert_eq!(outcome.delivered, 1);
    }

    #[test]
    fn grant_saturates() {
        let credit = CreditGate::new();
        credit.grant(u32::MAX);
        credit.grant(u32::MAX);
        assert!(credit.available() <= Semaphore::MAX_PERMITS);
        assert!(credit.available() > 0);
    }

    #[test]
    fn delivery_mode_follows_config() {
        let interval = Duration::from_millis(20);
        assert_eq!(
            DeliveryMode::for_config(&RunConfig::default(), interval),
            DeliveryMode::Timed { interval }
        );
        assert_eq!(
            DeliveryMode::for_config(&RunConfig::default().with_data_on_demand(true), interval),
            DeliveryMode::OnDemand
        );
    }
}
