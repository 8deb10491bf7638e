//! Bulk operations coordinator.
//!
//! Every batch runs all-or-nothing: the repository guard is held from first
//! row to last (exclusive over the targeted set and then some), targets are
//! visited in ascending id order, and any failure restores the pre-batch
//! images before the error propagates. This is what keeps a web request and
//! a launcher from issuing conflicting transitions on the same job.

use crate::error::{BatchflowError, Result};
use crate::job::{Job, JobFilter, JobPatch, JobSpec};
use crate::store::JobRepository;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

impl JobRepository {
    /// Create a batch of jobs in one transaction. Each job runs its own
    /// post-create gating; any failure rolls the entire batch back.
    pub async fn bulk_create(&self, specs: Vec<JobSpec>) -> Result<Vec<Job>> {
        let mut tables = self.tables.lock();
        let events_mark = tables.events.len();
        let mut created: Vec<Uuid> = Vec::with_capacity(specs.len());

        for spec in specs {
            match tables.create(spec) {
                Ok(job) => created.push(job.id),
                Err(e) => {
                    for id in &created {
                        tables.jobs.remove(id);
                        tables.transfers.remove(id);
                    }
                    tables.events.truncate(events_mark);
                    return Err(e);
                }
            }
        }

        info!("Bulk-created {} jobs", created.len());
        Ok(created
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect())
    }

    /// Apply per-job patches in one transaction. Patches are applied in
    /// ascending id order; a job locked by another holder merely has its
    /// non-data fields skipped (per the mutation contract), which is not an
    /// error. A missing target or an illegal patch aborts the whole batch.
    pub async fn bulk_apply_patch(&self, patches: HashMap<Uuid, JobPatch>) -> Result<Vec<Job>> {
        let mut tables = self.tables.lock();

        let mut ids: Vec<Uuid> = patches.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            if !tables.jobs.contains_key(id) {
                return Err(BatchflowError::JobNotFound(*id));
            }
        }

        let pre_images: Vec<Job> = ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect();
        let events_mark = tables.events.len();

        for id in &ids {
            let patch = match patches.get(id) {
                Some(patch) => patch.clone(),
                None => continue,
            };
            if let Err(e) = tables.apply_patch(*id, patch) {
                for pre in &pre_images {
                    tables.jobs.insert(pre.id, pre.clone());
                }
                tables.events.truncate(events_mark);
                return Err(e);
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect())
    }

    /// Apply one patch to every job matching the filter, same discipline as
    /// `bulk_apply_patch`.
    pub async fn bulk_update_queryset(
        &self,
        filter: &JobFilter,
        patch: JobPatch,
    ) -> Result<Vec<Job>> {
        let mut tables = self.tables.lock();

        let mut ids: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .map(|job| job.id)
            .collect();
        ids.sort_unstable();

        let pre_images: Vec<Job> = ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect();
        let events_mark = tables.events.len();

        for id in &ids {
            if let Err(e) = tables.apply_patch(*id, patch.clone()) {
                for pre in &pre_images {
                    tables.jobs.insert(pre.id, pre.clone());
                }
                tables.events.truncate(events_mark);
                return Err(e);
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| tables.jobs.get(id).cloned())
            .collect())
    }

    /// Delete every job matching the filter. A locked job anywhere in the
    /// batch aborts the whole transaction: no partial deletion of a mixed
    /// set. Returns the number of jobs removed.
    pub async fn bulk_delete_queryset(&self, filter: &JobFilter) -> Result<usize> {
        let mut tables = self.tables.lock();

        let mut ids: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .map(|job| job.id)
            .collect();
        ids.sort_unstable();

        // Reject the batch up front so nothing is removed from a mixed set.
        for id in &ids {
            if let Some(job) = tables.jobs.get(id) {
                if job.is_locked() {
                    return Err(BatchflowError::Validation(format!(
                        "Can't delete active Job {}: currently {}",
                        id,
                        job.state.busy_description()
                    )));
                }
            }
        }

        let count = ids.len();
        for id in ids {
            tables.delete(id)?;
        }
        info!("Bulk-deleted {} jobs", count);
        Ok(count)
    }
}
