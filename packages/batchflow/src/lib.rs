/*
 * Batchflow - HPC Job Orchestration Core
 *
 * Orchestrates job execution across a DAG of dependent work units.
 *
 * Architecture:
 * - Job entity + state machine (fixed transition table, per-state hooks)
 * - DAG dependency gate (parents must reach JOB_FINISHED)
 * - Backend auto-binder (bind iff exactly one registered backend)
 * - Job lock manager (exclusive claim + heartbeat + stale sweep)
 * - Append-only event log (one entry per mutation/transition)
 * - Bulk operations coordinator (all-or-nothing batches)
 * - Scheduler adapter (submit/status over an external CLI tool)
 *
 * Two process domains share no memory - web requests and launcher daemons
 * coordinate exclusively through the repository.
 */

pub mod bulk;
pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod lock;
pub mod scheduler;
pub mod store;

// Re-exports
pub use config::RepositoryConfig;
pub use error::{BatchflowError, Result};
pub use event::EventLog;
pub use job::{
    Job, JobFilter, JobPatch, JobSpec, JobState, ResourceSpec, TransferDirection, TransferItem,
    TransferSpec, TransferState,
};
pub use lock::JobLock;
pub use scheduler::{SchedulerBackend, SchedulerClient, StatusRecord};
pub use store::JobRepository;
