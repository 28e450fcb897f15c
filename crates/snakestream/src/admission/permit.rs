//! SessionPermit - proof of admission, releases its slot exactly once.

use std::sync::Arc;

use super::controller::{AdmissionController, SessionId};

/// Held by a session for its whole lifetime.
///
/// On drop: the slot is released unless [`release`](Self::release) already did it.
#[must_use = "dropping the permit releases the admission slot"]
pub struct SessionPermit {
    id: SessionId,
    controller: Arc<AdmissionController>,
    released: bool,
}

impl SessionPermit {
    pub(super) fn new(id: SessionId, controller: Arc<AdmissionController>) -> Self {
        Self {
            id,
            controller,
            released: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the slot now. Returns `true` only on the call that actually freed it.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.controller.release(self.id)
    }
}

impl std::fmt::Debug for SessionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPermit")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(session_id = %self.id, "Permit dropped, releasing slot");
            self.release();
        }
    }
}
