//! Session registry with a hard concurrency cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use snakestream_bridge::DataMode;

use super::permit::SessionPermit;

/// Unique identifier for a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry entry for a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    /// Known once the handshake has parsed the run config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_mode: Option<DataMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("at capacity ({max} concurrent streams)")]
    Rejected { max: usize },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Live-session registry.
///
/// The count is reserved with a compare-and-increment so concurrent admissions can
/// never overshoot `max_streams`; the map holds non-owning entries for introspection.
pub struct AdmissionController {
    max_streams: usize,
    live: AtomicUsize,
    sessions: DashMap<SessionId, SessionInfo>,
}

impl AdmissionController {
    pub fn new(max_streams: usize) -> Arc<Self> {
        Arc::new(Self {
            max_streams,
            live: AtomicUsize::new(0),
            sessions: DashMap::new(),
        })
    }

    /// Admit a new session, or reject it if `max_streams` sessions are live.
    pub fn try_admit(self: &Arc<Self>) -> Result<SessionPermit, AdmissionError> {
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_streams).then_some(n + 1)
            });
        if reserved.is_err() {
            tracing::warn!(max_streams = self.max_streams, "Admission rejected");
            return Err(AdmissionError::Rejected {
                max: self.max_streams,
            });
        }

        let id = SessionId::new();
        self.sessions.insert(
            id,
            SessionInfo {
                id,
                started_at: Utc::now(),
                data_mode: None,
            },
        );
        tracing::info!(session_id = %id, live = self.live(), "Session admitted");
        Ok(SessionPermit::new(id, Arc::clone(self)))
    }

    /// Release a session's slot. Returns `false` if it was already released.
    pub fn release(&self, id: SessionId) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        tracing::info!(session_id = %id, live = previous - 1, "Session released");
        true
    }

    pub fn set_data_mode(&self, id: SessionId, mode: DataMode) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.data_mode = Some(mode);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn available(&self) -> usize {
        self.max_streams.saturating_sub(self.live())
    }

    /// Snapshot of live sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}
