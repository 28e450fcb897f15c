//! StreamService: transport-agnostic session lifecycle management.
//!
//! This service owns:
//! - Admission control (live-session registry and cap)
//! - The worker spawner every session uses
//! - Session settings
//! - Shutdown coordination (cancels live sessions, waits for their teardown)
//!
//! Transports (WebSocket, in-memory) admit through this service, then hand it the
//! connection to run as a session.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{AdmissionController, AdmissionError, SessionInfo, SessionPermit};
use crate::health::Health;
use crate::session::{Session, SessionError, SessionSettings, SessionSummary};
use crate::transport::memory::{self, MemoryClient};
use crate::transport::{ClientSink, ClientStream};
use crate::version::VersionInfo;
use crate::worker_bridge::WorkerSpawner;

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions: Vec<SessionInfo>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }
}

pub struct StreamService {
    admission: Arc<AdmissionController>,
    spawner: Arc<dyn WorkerSpawner>,
    settings: SessionSettings,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    version: VersionInfo,
}

impl StreamService {
    pub fn new(max_streams: usize, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            admission: AdmissionController::new(max_streams),
            spawner,
            settings: SessionSettings::default(),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            version: VersionInfo::new(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Reserve a session slot. Refused at capacity and once shutdown has begun.
    pub fn admit(&self) -> Result<SessionPermit, AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }
        self.admission.try_admit()
    }

    /// Run an admitted connection as a session on the current task.
    pub async fn run_session<S, R>(
        &self,
        permit: SessionPermit,
        sink: S,
        stream: R,
    ) -> Result<SessionSummary, SessionError>
    where
        S: ClientSink,
        R: ClientStream,
    {
        let mut session = Session::new(permit, sink, stream, self.settings.clone(), &self.shutdown);
        self.sessions
            .track_future(session.run(self.spawner.as_ref()))
            .await
    }

    /// Run an admitted connection as a session on its own task.
    pub fn spawn_session<S, R>(
        self: &Arc<Self>,
        permit: SessionPermit,
        sink: S,
        stream: R,
    ) -> JoinHandle<Result<SessionSummary, SessionError>>
    where
        S: ClientSink,
        R: ClientStream,
    {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_session(permit, sink, stream).await })
    }

    /// Open an in-memory connection and start a session for it.
    pub fn connect_memory(self: &Arc<Self>) -> Result<MemoryClient, AdmissionError> {
        let permit = self.admit()?;
        let (sink, stream, client) = memory::connection();
        self.spawn_session(permit, sink, stream);
        Ok(client)
    }

    pub fn health(&self) -> HealthSnapshot {
        let active_sessions = self.admission.live();
        let max_sessions = self.admission.max_streams();
        HealthSnapshot {
            state: Health::from_capacity(active_sessions, max_sessions, self.is_shutting_down()),
            active_sessions,
            max_sessions,
            sessions: self.admission.sessions(),
            version: self.version.clone(),
        }
    }

    /// Refuse new sessions and cancel live ones.
    pub fn trigger_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(live = self.admission.live(), "Shutting down stream service");
        }
        self.shutdown.cancel();
        self.sessions.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait up to `timeout` for running sessions to finish. Returns false on timeout.
    pub async fn wait_for_sessions(&self, timeout: Duration) -> bool {
        self.sessions.close();
        let drained = tokio::time::timeout(timeout, self.sessions.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                live = self.admission.live(),
                "Sessions still running after shutdown grace"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snakestream_bridge::{EngineError, InitRecord, RunConfig, SimulationEngine, StepRecord};

    use crate::session::{ACK, END, SessionEnd};
    use crate::transport::OutboundMessage;
    use crate::worker_bridge::TaskSpawner;

    struct Countdown(u32);

    impl SimulationEngine for Countdown {
        fn start(&mut self, _: &RunConfig) -> Result<InitRecord, EngineError> {
            Ok(InitRecord(json!({"width": 2, "height": 2})))
        }

        fn step(&mut self) -> Result<Option<StepRecord>, EngineError> {
            if self.0 == 0 {
                return Ok(None);
            }
            self.0 -= 1;
            std::thread::sleep(Duration::from_millis(2));
            Ok(Some(StepRecord(json!({"left": self.0}))))
        }
    }

    fn service(max_streams: usize, steps: u32) -> Arc<StreamService> {
        let settings = SessionSettings::default()
            .with_push_interval(Duration::from_millis(2))
            .with_poll_timeout(Duration::from_millis(20))
            .with_stop_grace(Duration::from_millis(500));
        Arc::new(
            StreamService::new(max_streams, Arc::new(TaskSpawner::new(move || Countdown(steps))))
                .with_settings(settings),
        )
    }

    #[tokio::test]
    async fn memory_session_streams_and_releases() {
        let service = service(2, 2);
        let mut client = service.connect_memory().unwrap();
        assert_eq!(service.admission().live(), 1);

        client.send_json(&json!({}));
        let messages = client.drain().await;
        assert_eq!(messages.first(), Some(&OutboundMessage::text(ACK)));
        assert_eq!(messages.last(), Some(&OutboundMessage::text(END)));
        assert_eq!(messages.len(), 5);

        assert!(service.wait_for_sessions(Duration::from_secs(5)).await);
        assert_eq!(service.admission().live(), 0);
    }

    #[tokio::test]
    async fn rejects_beyond_max_streams() {
        let service = service(1, 1000);
        let _first = service.connect_memory().unwrap();
        assert!(matches!(
            service.connect_memory(),
            Err(AdmissionError::Rejected { max: 1 })
        ));
        assert_eq!(service.health().state, Health::Busy);
    }

    #[tokio::test]
    async fn shutdown_cancels_sessions_and_refuses_new_ones() {
        let service = service(3, u32::MAX);
        let mut client = service.connect_memory().unwrap();
        client.send_json(&json!({}));
        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)).await,
            Some(OutboundMessage::text(ACK))
        );

        service.trigger_shutdown();
        assert!(matches!(
            service.connect_memory(),
            Err(AdmissionError::ShuttingDown)
        ));
        assert!(service.wait_for_sessions(Duration::from_secs(5)).await);
        assert_eq!(service.admission().live(), 0);
        assert_eq!(service.health().state, Health::ShuttingDown);

        let rest = client.drain().await;
        assert_eq!(rest.last(), Some(&OutboundMessage::text(END)));
    }

    #[tokio::test]
    async fn spawned_session_reports_summary() {
        let service = service(1, 3);
        let permit = service.admit().unwrap();
        let (sink, stream, mut client) = memory::connection();
        let handle = service.spawn_session(permit, sink, stream);

        client.send_json(&json!({"grid_width": 8}));
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.steps_received, 3);
        assert_eq!(summary.end, SessionEnd::WorkerChannelClosed);
    }

    #[test]
    fn health_snapshot_lists_sessions() {
        let service = service(2, 1);
        let snapshot = service.health();
        assert!(snapshot.is_ready());
        assert_eq!(snapshot.max_sessions, 2);
        assert!(snapshot.sessions.is_empty());

        let _permit = service.admit().unwrap();
        let snapshot = service.health();
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.sessions.len(), 1);
    }
}
