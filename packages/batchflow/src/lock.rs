use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-bounded exclusive-processing claim on jobs. The holder refreshes
/// `heartbeat` on a fixed interval; a heartbeat older than the configured
/// expiration makes the lock eligible for the stale sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLock {
    pub id: Uuid,
    pub site: String,
    pub label: String,
    pub heartbeat: DateTime<Utc>,
}

impl JobLock {
    pub fn new(site: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            site: site.into(),
            label: label.into(),
            heartbeat: Utc::now(),
        }
    }

    /// Refresh the heartbeat. Identity and label never change.
    pub fn touch(&mut self) {
        self.heartbeat = Utc::now();
    }
}
