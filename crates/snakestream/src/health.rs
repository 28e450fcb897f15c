//! Health status types for the broker.

use serde::{Deserialize, Serialize};

/// Health status reported by `/health-check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Accepting new streams
    Ready,
    /// At capacity (max_streams sessions live)
    Busy,
    /// Draining sessions, refusing new ones
    ShuttingDown,
}

impl Health {
    pub fn from_capacity(live: usize, max: usize, shutting_down: bool) -> Self {
        if shutting_down {
            Health::ShuttingDown
        } else if live >= max {
            Health::Busy
        } else {
            Health::Ready
        }
    }
}
