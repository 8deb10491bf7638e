use crate::config::RepositoryConfig;
use crate::error::{BatchflowError, Result};
use crate::event::EventLog;
use crate::job::{
    Job, JobFilter, JobPatch, JobSpec, JobState, TransferItem, TransferState,
};
use crate::lock::JobLock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Backing tables. One guard serializes every mutation; bulk operations
/// hold it for the whole batch, which subsumes per-row exclusive locking.
pub(crate) struct Tables {
    pub(crate) jobs: HashMap<Uuid, Job>,
    pub(crate) locks: HashMap<Uuid, JobLock>,
    pub(crate) events: Vec<EventLog>,
    pub(crate) transfers: HashMap<Uuid, Vec<TransferItem>>,
    /// app_exchange id -> registered backend ids
    pub(crate) backends: HashMap<Uuid, Vec<Uuid>>,
}

impl Tables {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            locks: HashMap::new(),
            events: Vec::new(),
            transfers: HashMap::new(),
            backends: HashMap::new(),
        }
    }

    /// DAG dependency gate: true iff the job has at least one parent and
    /// fewer than all of them reached JOB_FINISHED. Acyclicity is a caller
    /// precondition.
    pub(crate) fn awaiting_parents(&self, id: Uuid) -> Result<bool> {
        let job = self.jobs.get(&id).ok_or(BatchflowError::JobNotFound(id))?;
        if job.parents.is_empty() {
            return Ok(false);
        }
        let finished = job
            .parents
            .iter()
            .filter(|p| {
                self.jobs
                    .get(p)
                    .map(|parent| parent.state == JobState::JobFinished)
                    .unwrap_or(false)
            })
            .count();
        Ok(finished < job.parents.len())
    }

    /// Backend auto-binder: bind iff the exchange has exactly one registered
    /// backend, otherwise clear and leave binding to an explicit
    /// acquisition step.
    pub(crate) fn rebind(&mut self, id: Uuid) -> Result<()> {
        let exchange = self
            .jobs
            .get(&id)
            .ok_or(BatchflowError::JobNotFound(id))?
            .app_exchange;
        let choice = match self.backends.get(&exchange) {
            Some(backends) if backends.len() == 1 => Some(backends[0]),
            _ => None,
        };
        if let Some(job) = self.jobs.get_mut(&id) {
            job.app_backend = choice;
        }
        Ok(())
    }

    pub(crate) fn pending_transfer_count(&self, id: Uuid) -> usize {
        self.transfers
            .get(&id)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.state == TransferState::Pending)
                    .count()
            })
            .unwrap_or(0)
    }

    /// State machine entry point. Validates against the transition table and
    /// leaves the job untouched on violation; on success persists the new
    /// state, appends exactly one event (from_state captured before the
    /// mutation), then dispatches the target-state hook.
    pub(crate) fn transition(
        &mut self,
        id: Uuid,
        new_state: JobState,
        message: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or(BatchflowError::JobNotFound(id))?;
        let old_state = job.state;
        if !old_state.can_transition_to(new_state) {
            return Err(BatchflowError::InvalidStateTransition {
                from: old_state,
                to: new_state,
            });
        }
        let ts = timestamp.unwrap_or_else(Utc::now);
        if new_state == JobState::RunError || (new_state == JobState::Failed && !message.is_empty())
        {
            job.last_error = message.to_string();
        }
        job.state = new_state;
        job.last_update = ts;
        self.events
            .push(EventLog::transition(id, old_state, new_state, ts, message));
        info!("Job {} transitioned {} -> {}", id, old_state, new_state);
        self.run_hook(id, new_state, ts)
    }

    /// Fixed state -> handler dispatch. No hook targets its own triggering
    /// state, so the recursion through transition() terminates.
    fn run_hook(&mut self, id: Uuid, new_state: JobState, ts: DateTime<Utc>) -> Result<()> {
        match new_state {
            JobState::Ready => {
                let bound = self
                    .jobs
                    .get(&id)
                    .map(|job| job.app_backend.is_some())
                    .unwrap_or(false);
                if bound && self.pending_transfer_count(id) == 0 {
                    self.transition(id, JobState::StagedIn, "No data to transfer", Some(ts))?;
                }
            }
            JobState::Reset => {
                self.rebind(id)?;
                let target = if self.awaiting_parents(id)? {
                    JobState::AwaitingParents
                } else {
                    JobState::Ready
                };
                self.transition(id, target, "", Some(ts))?;
            }
            // Extension point: no built-in effect.
            JobState::JobFinished => {}
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn create(&mut self, spec: JobSpec) -> Result<Job> {
        if spec.workdir.starts_with('/') || spec.workdir.starts_with('\\') {
            return Err(BatchflowError::validation(format!(
                "workdir must be relative to the site data directory: {}",
                spec.workdir
            )));
        }
        for parent in &spec.parents {
            if !self.jobs.contains_key(parent) {
                return Err(BatchflowError::validation(format!(
                    "Unknown parent job: {}",
                    parent
                )));
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = Job {
            id,
            workdir: spec.workdir,
            tags: spec.tags,
            parameters: spec.parameters,
            data: spec.data,
            state: JobState::Created,
            owner: spec.owner,
            app_exchange: spec.app_exchange,
            app_backend: None,
            batch_job: None,
            lock: None,
            parents: spec.parents,
            resources: spec.resources,
            return_code: None,
            last_error: String::new(),
            last_update: now,
        };
        self.jobs.insert(id, job);

        let items = spec
            .transfers
            .into_iter()
            .map(|t| TransferItem {
                id: Uuid::new_v4(),
                job: id,
                direction: t.direction,
                source: t.source,
                destination: t.destination,
                state: TransferState::Pending,
            })
            .collect();
        self.transfers.insert(id, items);

        self.rebind(id)?;
        let target = if self.awaiting_parents(id)? {
            JobState::AwaitingParents
        } else {
            JobState::Ready
        };
        self.transition(id, target, "", None)?;

        self.jobs
            .get(&id)
            .cloned()
            .ok_or(BatchflowError::JobNotFound(id))
    }

    /// Single-job mutation contract. `data` merges and `return_code` applies
    /// regardless of lock state; every other field applies only while
    /// unlocked and is silently skipped otherwise. A target state delegates
    /// to the state machine, which is its own guarded path.
    pub(crate) fn apply_patch(&mut self, id: Uuid, patch: JobPatch) -> Result<()> {
        let locked = self
            .jobs
            .get(&id)
            .ok_or(BatchflowError::JobNotFound(id))?
            .is_locked();

        if !locked {
            if let Some(workdir) = &patch.workdir {
                if workdir.starts_with('/') || workdir.starts_with('\\') {
                    return Err(BatchflowError::validation(format!(
                        "workdir must be relative to the site data directory: {}",
                        workdir
                    )));
                }
            }
        }

        let mut messages: Vec<String> = Vec::new();
        let state_now;
        {
            let job = self
                .jobs
                .get_mut(&id)
                .ok_or(BatchflowError::JobNotFound(id))?;

            if let Some(data) = &patch.data {
                let mut keys: Vec<&str> = data.keys().map(|k| k.as_str()).collect();
                keys.sort_unstable();
                for (k, v) in data {
                    job.data.insert(k.clone(), v.clone());
                }
                messages.push(format!("Set data {:?}", keys));
            }

            if let Some(rc) = patch.return_code {
                let old = job.return_code;
                job.return_code = Some(rc);
                messages.push(format!("Return code changed: {:?} -> {:?}", old, Some(rc)));
            }

            if !locked {
                if let Some(workdir) = &patch.workdir {
                    messages.push(format!("Workdir changed: {} -> {}", job.workdir, workdir));
                    job.workdir = workdir.clone();
                }
                if let Some(batch_job) = patch.batch_job {
                    messages.push(format!(
                        "Batch job changed: {:?} -> {:?}",
                        job.batch_job,
                        Some(batch_job)
                    ));
                    job.batch_job = Some(batch_job);
                }
                if let Some(tags) = &patch.tags {
                    messages.push(format!("Tags changed: {:?} -> {:?}", job.tags, tags));
                    job.tags = tags.clone();
                }
                if let Some(parameters) = &patch.parameters {
                    messages.push(format!(
                        "Parameters changed: {:?} -> {:?}",
                        job.parameters, parameters
                    ));
                    job.parameters = parameters.clone();
                }
                if let Some(v) = patch.num_nodes {
                    messages.push(format!(
                        "Num nodes changed: {} -> {}",
                        job.resources.num_nodes, v
                    ));
                    job.resources.num_nodes = v;
                }
                if let Some(v) = patch.ranks_per_node {
                    messages.push(format!(
                        "Ranks per node changed: {} -> {}",
                        job.resources.ranks_per_node, v
                    ));
                    job.resources.ranks_per_node = v;
                }
                if let Some(v) = patch.threads_per_rank {
                    messages.push(format!(
                        "Threads per rank changed: {} -> {}",
                        job.resources.threads_per_rank, v
                    ));
                    job.resources.threads_per_rank = v;
                }
                if let Some(v) = patch.threads_per_core {
                    messages.push(format!(
                        "Threads per core changed: {} -> {}",
                        job.resources.threads_per_core, v
                    ));
                    job.resources.threads_per_core = v;
                }
                if let Some(v) = &patch.cpu_affinity {
                    messages.push(format!(
                        "Cpu affinity changed: {} -> {}",
                        job.resources.cpu_affinity, v
                    ));
                    job.resources.cpu_affinity = v.clone();
                }
                if let Some(v) = patch.gpus_per_rank {
                    messages.push(format!(
                        "Gpus per rank changed: {} -> {}",
                        job.resources.gpus_per_rank, v
                    ));
                    job.resources.gpus_per_rank = v;
                }
                if let Some(v) = patch.node_packing_count {
                    messages.push(format!(
                        "Node packing count changed: {} -> {}",
                        job.resources.node_packing_count, v
                    ));
                    job.resources.node_packing_count = v;
                }
                if let Some(v) = patch.wall_time_min {
                    messages.push(format!(
                        "Wall time min changed: {} -> {}",
                        job.resources.wall_time_min, v
                    ));
                    job.resources.wall_time_min = v;
                }
            }

            if !messages.is_empty() {
                job.last_update = Utc::now();
            }
            state_now = job.state;
        }
        for message in messages {
            self.events.push(EventLog::update(id, state_now, message));
        }

        if let Some(target) = patch.state {
            let message = patch.state_message.clone().unwrap_or_default();
            self.transition(id, target, &message, patch.state_timestamp)?;
        }
        Ok(())
    }

    pub(crate) fn delete(&mut self, id: Uuid) -> Result<()> {
        let job = self.jobs.get(&id).ok_or(BatchflowError::JobNotFound(id))?;
        if job.is_locked() {
            return Err(BatchflowError::Validation(format!(
                "Can't delete active Job {}: currently {}",
                id,
                job.state.busy_description()
            )));
        }
        self.jobs.remove(&id);
        // Events and transfer items cascade with the job.
        self.events.retain(|event| event.job != id);
        self.transfers.remove(&id);
        info!("Deleted job {}", id);
        Ok(())
    }

    /// Lock deletion nulls the weak back-reference on every job holding it.
    pub(crate) fn clear_lock_refs(&mut self, lock_id: Uuid) {
        for job in self.jobs.values_mut() {
            if job.lock == Some(lock_id) {
                job.lock = None;
            }
        }
    }
}

/// Mediator over the transactional durable store. The API is async and
/// interface-first over in-memory tables, so a SQL pool can slot in behind
/// the same signatures.
pub struct JobRepository {
    pub(crate) config: RepositoryConfig,
    pub(crate) tables: Arc<Mutex<Tables>>,
}

impl JobRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self {
            config,
            tables: Arc::new(Mutex::new(Tables::new())),
        }
    }

    pub async fn register_backend(&self, app_exchange: Uuid, backend: Uuid) {
        let mut tables = self.tables.lock();
        tables.backends.entry(app_exchange).or_default().push(backend);
    }

    /// Create a job: validate, persist, attach transfer items, auto-bind,
    /// then gate into AWAITING_PARENTS or READY (hooks may advance further
    /// within the same call).
    pub async fn create(&self, spec: JobSpec) -> Result<Job> {
        let mut tables = self.tables.lock();
        tables.create(spec)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        let tables = self.tables.lock();
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(BatchflowError::JobNotFound(id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let tables = self.tables.lock();
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Audit trail for one job, ordered by timestamp.
    pub async fn events_for(&self, id: Uuid) -> Vec<EventLog> {
        let tables = self.tables.lock();
        let mut events: Vec<EventLog> = tables
            .events
            .iter()
            .filter(|event| event.job == id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        events
    }

    pub async fn transfers_for(&self, id: Uuid) -> Vec<TransferItem> {
        let tables = self.tables.lock();
        tables.transfers.get(&id).cloned().unwrap_or_default()
    }

    pub async fn mark_transfer_done(&self, job_id: Uuid, transfer_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock();
        let items = tables
            .transfers
            .get_mut(&job_id)
            .ok_or(BatchflowError::JobNotFound(job_id))?;
        let item = items
            .iter_mut()
            .find(|item| item.id == transfer_id)
            .ok_or_else(|| {
                BatchflowError::validation(format!("Unknown transfer item: {}", transfer_id))
            })?;
        item.state = TransferState::Done;
        Ok(())
    }

    /// Apply a partial update under the mutation contract. Rolls back the
    /// job's pre-image if the patch fails partway (e.g. an illegal target
    /// state), so nothing is partially applied.
    pub async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job> {
        let mut tables = self.tables.lock();
        let pre_image = tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(BatchflowError::JobNotFound(id))?;
        let events_mark = tables.events.len();
        match tables.apply_patch(id, patch) {
            Ok(()) => tables
                .jobs
                .get(&id)
                .cloned()
                .ok_or(BatchflowError::JobNotFound(id)),
            Err(e) => {
                tables.jobs.insert(id, pre_image);
                tables.events.truncate(events_mark);
                Err(e)
            }
        }
    }

    /// Drive the state machine directly (no field changes).
    pub async fn transition(
        &self,
        id: Uuid,
        new_state: JobState,
        message: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Job> {
        let mut tables = self.tables.lock();
        tables.transition(id, new_state, message, timestamp)?;
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(BatchflowError::JobNotFound(id))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.delete(id)
    }

    pub async fn awaiting_parents(&self, id: Uuid) -> Result<bool> {
        let tables = self.tables.lock();
        tables.awaiting_parents(id)
    }

    pub async fn rebind(&self, id: Uuid) -> Result<Job> {
        let mut tables = self.tables.lock();
        tables.rebind(id)?;
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(BatchflowError::JobNotFound(id))
    }

    // ----- lock manager -----

    pub async fn acquire_lock(&self, site: &str, label: &str) -> JobLock {
        let mut tables = self.tables.lock();
        let lock = JobLock::new(site, label);
        info!("Acquired lock {} for {}/{}", lock.id, site, label);
        tables.locks.insert(lock.id, lock.clone());
        lock
    }

    pub async fn get_lock(&self, lock_id: Uuid) -> Option<JobLock> {
        let tables = self.tables.lock();
        tables.locks.get(&lock_id).cloned()
    }

    /// Refresh the holder's heartbeat. Idempotent while the lock lives; a
    /// swept lock surfaces as LockNotFound so the holder learns it lost
    /// its claim.
    pub async fn tick(&self, lock_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock();
        let lock = tables
            .locks
            .get_mut(&lock_id)
            .ok_or(BatchflowError::LockNotFound(lock_id))?;
        lock.touch();
        Ok(())
    }

    pub async fn release(&self, lock_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.locks.remove(&lock_id).is_none() {
            return Err(BatchflowError::LockNotFound(lock_id));
        }
        tables.clear_lock_refs(lock_id);
        info!("Released lock {}", lock_id);
        Ok(())
    }

    /// Stale-lock sweep. Staleness is observed and the lock deleted in one
    /// guarded step, so a concurrent tick cannot race the sweep. Returns the
    /// number of locks removed.
    pub async fn clear_stale(&self) -> usize {
        let mut tables = self.tables.lock();
        let expiry = Utc::now() - self.config.lock_expiration;
        let stale: Vec<Uuid> = tables
            .locks
            .values()
            .filter(|lock| lock.heartbeat <= expiry)
            .map(|lock| lock.id)
            .collect();
        for lock_id in &stale {
            tables.locks.remove(lock_id);
            tables.clear_lock_refs(*lock_id);
        }
        info!("Cleared {} expired locks", stale.len());
        stale.len()
    }

    /// Launcher bulk-acquire: claim up to `max_count` unlocked jobs in
    /// launcher-eligible states, least recently updated first so the oldest
    /// backlog drains ahead of fresh work. Each claimed job is stamped with
    /// the lock id.
    pub async fn acquire_jobs(&self, lock_id: Uuid, max_count: usize) -> Result<Vec<Job>> {
        let mut tables = self.tables.lock();
        if !tables.locks.contains_key(&lock_id) {
            return Err(BatchflowError::LockNotFound(lock_id));
        }
        let cap = max_count.min(self.config.acquire_batch_cap);
        let mut eligible: Vec<(DateTime<Utc>, Uuid)> = tables
            .jobs
            .values()
            .filter(|job| {
                job.lock.is_none()
                    && matches!(
                        job.state,
                        JobState::Preprocessed | JobState::RestartReady
                    )
            })
            .map(|job| (job.last_update, job.id))
            .collect();
        eligible.sort_unstable();

        let mut claimed = Vec::new();
        for (_, id) in eligible.into_iter().take(cap) {
            if let Some(job) = tables.jobs.get_mut(&id) {
                job.lock = Some(lock_id);
                claimed.push(job.clone());
            }
        }
        if claimed.is_empty() {
            warn!("Lock {} found no acquirable jobs", lock_id);
        } else {
            info!("Lock {} acquired {} jobs", lock_id, claimed.len());
        }
        Ok(claimed)
    }
}

impl Default for JobRepository {
    fn default() -> Self {
        Self::new(RepositoryConfig::default())
    }
}
