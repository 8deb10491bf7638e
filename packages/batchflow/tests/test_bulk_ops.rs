//! Integration tests for the bulk operations coordinator: all-or-nothing
//! batches, interaction with held job locks, and filtered queryset ops.

use batchflow::{
    BatchflowError, JobFilter, JobPatch, JobRepository, JobSpec, JobState,
};
use std::collections::HashMap;
use uuid::Uuid;

fn spec(workdir: &str) -> JobSpec {
    JobSpec::new(workdir, "owner-1", Uuid::new_v4())
}

async fn drive_to_launcher(repo: &JobRepository, id: Uuid) {
    for state in [JobState::StagedIn, JobState::Preprocessed] {
        repo.transition(id, state, "", None).await.unwrap();
    }
}

#[tokio::test]
async fn test_bulk_patch_with_one_locked_member() {
    let repo = JobRepository::default();
    let jobs = repo
        .bulk_create(vec![spec("runs/a"), spec("runs/b"), spec("runs/c")])
        .await
        .unwrap();

    // A launcher holds the middle job.
    drive_to_launcher(&repo, jobs[1].id).await;
    let lock = repo.acquire_lock("theta", "launcher-1").await;
    let claimed = repo.acquire_jobs(lock.id, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, jobs[1].id);

    let mut patches = HashMap::new();
    for job in &jobs {
        patches.insert(
            job.id,
            JobPatch {
                num_nodes: Some(32),
                ..Default::default()
            },
        );
    }
    // No error: the locked job's non-data fields are skipped, the other
    // two update, and all three commit.
    repo.bulk_apply_patch(patches).await.unwrap();

    assert_eq!(repo.get(jobs[0].id).await.unwrap().resources.num_nodes, 32);
    assert_eq!(repo.get(jobs[1].id).await.unwrap().resources.num_nodes, 1);
    assert_eq!(repo.get(jobs[2].id).await.unwrap().resources.num_nodes, 32);
}

#[tokio::test]
async fn test_bulk_update_queryset_by_state() {
    let repo = JobRepository::default();
    let jobs = repo
        .bulk_create(vec![spec("runs/a"), spec("runs/b")])
        .await
        .unwrap();
    repo.transition(jobs[0].id, JobState::StagedIn, "", None)
        .await
        .unwrap();

    let updated = repo
        .bulk_update_queryset(
            &JobFilter::by_states(vec![JobState::Ready]),
            JobPatch {
                wall_time_min: Some(90),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, jobs[1].id);
    assert_eq!(updated[0].resources.wall_time_min, 90);

    // The staged job was outside the filter and is untouched.
    assert_eq!(
        repo.get(jobs[0].id).await.unwrap().resources.wall_time_min,
        0
    );
}

#[tokio::test]
async fn test_bulk_patch_drives_transitions_with_hooks() {
    let repo = JobRepository::default();
    let exchange = Uuid::new_v4();
    repo.register_backend(exchange, Uuid::new_v4()).await;

    // Auto-advanced to STAGED_IN at creation (one backend, no transfers).
    let jobs = repo
        .bulk_create(vec![
            JobSpec::new("runs/a", "owner-1", exchange),
            JobSpec::new("runs/b", "owner-1", exchange),
        ])
        .await
        .unwrap();
    assert!(jobs.iter().all(|j| j.state == JobState::StagedIn));

    let mut patches = HashMap::new();
    for job in &jobs {
        patches.insert(
            job.id,
            JobPatch {
                state: Some(JobState::Preprocessed),
                ..Default::default()
            },
        );
    }
    let patched = repo.bulk_apply_patch(patches).await.unwrap();
    assert!(patched.iter().all(|j| j.state == JobState::Preprocessed));
}

#[tokio::test]
async fn test_bulk_delete_by_ids_cascades() {
    let repo = JobRepository::default();
    let jobs = repo
        .bulk_create(vec![spec("runs/a"), spec("runs/b"), spec("runs/c")])
        .await
        .unwrap();

    let removed = repo
        .bulk_delete_queryset(&JobFilter::by_ids(vec![jobs[0].id, jobs[2].id]))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(repo.events_for(jobs[0].id).await.is_empty());
    assert!(repo.get(jobs[1].id).await.is_ok());
}

#[tokio::test]
async fn test_bulk_delete_locked_batch_removes_nothing() {
    let repo = JobRepository::default();
    let jobs = repo
        .bulk_create(vec![spec("runs/a"), spec("runs/b")])
        .await
        .unwrap();
    drive_to_launcher(&repo, jobs[0].id).await;
    let lock = repo.acquire_lock("theta", "launcher-1").await;
    repo.acquire_jobs(lock.id, 10).await.unwrap();

    let err = repo
        .bulk_delete_queryset(&JobFilter::default())
        .await
        .unwrap_err();
    match err {
        BatchflowError::Validation(msg) => {
            assert!(msg.contains("Acquired by launcher"));
        }
        other => panic!("Expected Validation error, got {:?}", other),
    }
    assert_eq!(repo.list(&JobFilter::default()).await.len(), 2);

    // After release the same batch goes through.
    repo.release(lock.id).await.unwrap();
    let removed = repo
        .bulk_delete_queryset(&JobFilter::default())
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn test_bulk_create_with_dag_parents() {
    let repo = JobRepository::default();
    let parents = repo
        .bulk_create(vec![spec("runs/p0"), spec("runs/p1")])
        .await
        .unwrap();

    let children = repo
        .bulk_create(vec![
            spec("runs/c0").with_parents(vec![parents[0].id]),
            spec("runs/c1").with_parents(vec![parents[0].id, parents[1].id]),
        ])
        .await
        .unwrap();
    assert!(children
        .iter()
        .all(|c| c.state == JobState::AwaitingParents));

    // An unknown parent id anywhere rolls back the whole batch.
    let err = repo
        .bulk_create(vec![
            spec("runs/c2").with_parents(vec![parents[1].id]),
            spec("runs/c3").with_parents(vec![Uuid::new_v4()]),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, BatchflowError::Validation(_)));
    assert_eq!(repo.list(&JobFilter::default()).await.len(), 4);
}
