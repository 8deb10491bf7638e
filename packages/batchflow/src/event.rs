use crate::job::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable audit record. Owned by its job: deleting the job cascades to
/// its events. Append-only, ordered by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub id: Uuid,
    pub job: Uuid,
    pub from_state: JobState,
    pub to_state: JobState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl EventLog {
    /// Record a state transition edge.
    pub fn transition(
        job: Uuid,
        from_state: JobState,
        to_state: JobState,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            from_state,
            to_state,
            timestamp,
            message: message.into(),
        }
    }

    /// Record a field mutation: from_state and to_state both read the job's
    /// current state.
    pub fn update(job: Uuid, state: JobState, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            from_state: state,
            to_state: state,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    pub fn is_transition(&self) -> bool {
        self.from_state != self.to_state
    }
}
