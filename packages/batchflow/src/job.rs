use crate::error::{BatchflowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    AwaitingParents,
    Ready,
    StagedIn,
    Preprocessed,
    Running,
    RunDone,
    RunError,
    RunTimeout,
    RestartReady,
    Postprocessed,
    JobFinished,
    Failed,
    Killed,
    Reset,
}

impl JobState {
    pub const ALL: [JobState; 15] = [
        JobState::Created,
        JobState::AwaitingParents,
        JobState::Ready,
        JobState::StagedIn,
        JobState::Preprocessed,
        JobState::Running,
        JobState::RunDone,
        JobState::RunError,
        JobState::RunTimeout,
        JobState::RestartReady,
        JobState::Postprocessed,
        JobState::JobFinished,
        JobState::Failed,
        JobState::Killed,
        JobState::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::AwaitingParents => "AWAITING_PARENTS",
            JobState::Ready => "READY",
            JobState::StagedIn => "STAGED_IN",
            JobState::Preprocessed => "PREPROCESSED",
            JobState::Running => "RUNNING",
            JobState::RunDone => "RUN_DONE",
            JobState::RunError => "RUN_ERROR",
            JobState::RunTimeout => "RUN_TIMEOUT",
            JobState::RestartReady => "RESTART_READY",
            JobState::Postprocessed => "POSTPROCESSED",
            JobState::JobFinished => "JOB_FINISHED",
            JobState::Failed => "FAILED",
            JobState::Killed => "KILLED",
            JobState::Reset => "RESET",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        JobState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| BatchflowError::parse(format!("Invalid job state: {}", s)))
    }

    /// Legal targets from this state. Every state change goes through this
    /// table; there is no other path that mutates `Job::state`.
    pub fn allowed_targets(&self) -> &'static [JobState] {
        match self {
            JobState::Created => &[JobState::AwaitingParents, JobState::Ready],
            JobState::AwaitingParents => &[JobState::Ready],
            JobState::Ready => &[JobState::StagedIn, JobState::Failed],
            JobState::StagedIn => &[JobState::Preprocessed, JobState::Failed],
            JobState::Preprocessed => &[JobState::Running],
            JobState::Running => &[
                JobState::RunDone,
                JobState::RunError,
                JobState::RunTimeout,
                JobState::Killed,
            ],
            JobState::RunDone => &[
                JobState::Postprocessed,
                JobState::RestartReady,
                JobState::Failed,
            ],
            JobState::RunError => &[
                JobState::Postprocessed,
                JobState::RestartReady,
                JobState::Failed,
            ],
            JobState::RunTimeout => &[
                JobState::Postprocessed,
                JobState::RestartReady,
                JobState::Failed,
            ],
            JobState::RestartReady => &[JobState::Running],
            JobState::Postprocessed => &[JobState::JobFinished, JobState::Failed],
            JobState::JobFinished => &[JobState::Reset],
            JobState::Failed => &[JobState::Reset],
            JobState::Killed => &[JobState::Reset],
            JobState::Reset => &[JobState::AwaitingParents, JobState::Ready],
        }
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Human-readable activity for a locked job in this state. Surfaced when
    /// a delete is rejected because something is working on the job.
    pub fn busy_description(&self) -> &'static str {
        match self {
            JobState::Ready => "Staging in",
            JobState::StagedIn => "Preprocessing",
            JobState::Preprocessed => "Acquired by launcher",
            JobState::RestartReady => "Acquired by launcher",
            JobState::Running => "Running",
            JobState::RunDone => "Postprocessing",
            JobState::RunError => "Postprocessing (Error handling)",
            JobState::RunTimeout => "Postprocessing (Timeout handling)",
            JobState::Postprocessed => "Staging out",
            _ => "Busy",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-job resource request handed to the launcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub num_nodes: i32,
    pub ranks_per_node: i32,
    pub threads_per_rank: i32,
    pub threads_per_core: i32,
    pub cpu_affinity: String,
    pub gpus_per_rank: i32,
    pub node_packing_count: i32,
    pub wall_time_min: i32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            ranks_per_node: 1,
            threads_per_rank: 1,
            threads_per_core: 1,
            cpu_affinity: "depth".to_string(),
            gpus_per_rank: 0,
            node_packing_count: 1,
            wall_time_min: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Done,
}

/// Data-staging task attached to a job. Only the pending count matters to
/// the core; moving the bytes is someone else's problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    pub id: Uuid,
    pub job: Uuid,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    pub state: TransferState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSpec {
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
}

/// Job model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Workdir relative to the site data directory (cannot start with '/')
    pub workdir: String,
    /// Shallow k:v selectors, usable in filters
    pub tags: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    /// Merge-updated key-wise, never wholesale-replaced
    pub data: Map<String, Value>,
    pub state: JobState,
    /// Opaque owner identifier supplied by the identity boundary
    pub owner: String,
    pub app_exchange: Uuid,
    /// Auto-bound iff the exchange has exactly one registered backend
    pub app_backend: Option<Uuid>,
    /// External batch allocation the job may run under
    pub batch_job: Option<i64>,
    /// Weak back-reference to the active lock; cleared when the lock dies
    pub lock: Option<Uuid>,
    /// DAG edges, fixed at creation time
    pub parents: Vec<Uuid>,
    pub resources: ResourceSpec,
    pub return_code: Option<i32>,
    pub last_error: String,
    pub last_update: DateTime<Utc>,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// Creation input for a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub workdir: String,
    pub tags: HashMap<String, String>,
    pub owner: String,
    pub app_exchange: Uuid,
    pub parameters: HashMap<String, String>,
    pub data: Map<String, Value>,
    pub parents: Vec<Uuid>,
    pub transfers: Vec<TransferSpec>,
    pub resources: ResourceSpec,
}

impl JobSpec {
    pub fn new(workdir: impl Into<String>, owner: impl Into<String>, app_exchange: Uuid) -> Self {
        Self {
            workdir: workdir.into(),
            tags: HashMap::new(),
            owner: owner.into(),
            app_exchange,
            parameters: HashMap::new(),
            data: Map::new(),
            parents: Vec::new(),
            transfers: Vec::new(),
            resources: ResourceSpec::default(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<Uuid>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_transfers(mut self, transfers: Vec<TransferSpec>) -> Self {
        self.transfers = transfers;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }
}

/// Partial update for a single job. Absent fields are left alone; the lock
/// discipline in the mutation contract decides which present fields apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub workdir: Option<String>,
    pub tags: Option<HashMap<String, String>>,
    pub parameters: Option<HashMap<String, String>>,
    pub data: Option<Map<String, Value>>,
    pub return_code: Option<i32>,
    pub batch_job: Option<i64>,
    pub num_nodes: Option<i32>,
    pub ranks_per_node: Option<i32>,
    pub threads_per_rank: Option<i32>,
    pub threads_per_core: Option<i32>,
    pub cpu_affinity: Option<String>,
    pub gpus_per_rank: Option<i32>,
    pub node_packing_count: Option<i32>,
    pub wall_time_min: Option<i32>,
    pub state: Option<JobState>,
    pub state_message: Option<String>,
    pub state_timestamp: Option<DateTime<Utc>>,
}

/// Selector over the job table. All given criteria must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub ids: Option<Vec<Uuid>>,
    pub states: Option<Vec<JobState>>,
    pub tags: HashMap<String, String>,
}

impl JobFilter {
    pub fn by_ids(ids: Vec<Uuid>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn by_states(states: Vec<JobState>) -> Self {
        Self {
            states: Some(states),
            ..Default::default()
        }
    }

    pub fn by_tag(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = HashMap::new();
        tags.insert(key.into(), value.into());
        Self {
            tags,
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&job.id) {
                return false;
            }
        }
        if let Some(states) = &self.states {
            if !states.contains(&job.state) {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(k, v)| job.tags.get(k).map(|jv| jv == v).unwrap_or(false))
    }
}
