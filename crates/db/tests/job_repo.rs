//! Integration tests for the simulation job repository.
//!
//! Exercises the guarded SQL against a real database:
//! - Insert and lookup
//! - Terminal records rejecting further writes
//! - Stale and regressing progress writes
//! - Queue claims handing each job out once
//! - Filtered pagination with the unpaginated total

use std::collections::HashSet;

use qsim_core::types::new_job_id;
use qsim_db::models::job::{JobListQuery, JobOutcome, NewJob, ProgressWrite, STEP_COMPLETE};
use qsim_db::models::status::JobStatus;
use qsim_db::repositories::JobRepo;
use qsim_db::{JobStore, PgJobStore};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn new_job(method: &str) -> NewJob {
    NewJob {
        id: new_job_id(),
        method: method.to_string(),
        molecule_name: "H2".to_string(),
        molecule_spec: serde_json::json!({
            "name": "H2",
            "atoms": [
                { "symbol": "H", "position": [0.0, 0.0, 0.0] },
                { "symbol": "H", "position": [0.0, 0.0, 0.74] },
            ],
        }),
        config: serde_json::json!({}),
    }
}

fn outcome(energy: f64) -> JobOutcome {
    JobOutcome {
        energy,
        energy_history: vec![-1.0, energy],
        metadata: serde_json::json!({ "iterations": 2 }),
    }
}

async fn running_job(pool: &PgPool) -> NewJob {
    let job = new_job("vqe");
    JobRepo::insert(pool, &job).await.unwrap();
    assert!(JobRepo::mark_started(pool, job.id).await.unwrap());
    job
}

// ---------------------------------------------------------------------------
// Test: Insert and lookup
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_insert_and_find(pool: PgPool) {
    let input = new_job("vqe");
    let stored = JobRepo::insert(&pool, &input).await.unwrap();
    assert_eq!(stored.id, input.id);
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.progress, 0);
    assert_eq!(stored.progress_seq, 0);
    assert_eq!(stored.molecule_name, "H2");
    assert!(stored.claimed_at.is_none());
    assert!(stored.started_at.is_none());

    let found = JobRepo::find_by_id(&pool, input.id).await.unwrap().unwrap();
    assert_eq!(found.molecule_spec, input.molecule_spec);

    assert!(JobRepo::find_by_id(&pool, new_job_id()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: Terminal records are immutable
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_completed_job_rejects_further_writes(pool: PgPool) {
    let job = running_job(&pool).await;
    assert!(JobRepo::complete(&pool, job.id, &outcome(-1.137)).await.unwrap());

    assert!(!JobRepo::complete(&pool, job.id, &outcome(-9.0)).await.unwrap());
    assert!(!JobRepo::fail(&pool, job.id, "late failure").await.unwrap());
    assert!(!JobRepo::cancel(&pool, job.id).await.unwrap());
    assert!(!JobRepo::mark_started(&pool, job.id).await.unwrap());
    assert_eq!(
        JobRepo::update_progress(&pool, job.id, 99, 50, "late").await.unwrap(),
        ProgressWrite::Rejected
    );

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.current_step, STEP_COMPLETE);
    assert_eq!(stored.result_energy, Some(-1.137));
    assert_eq!(stored.energy_history, Some(vec![-1.0, -1.137]));
    assert!(stored.error_message.is_none());
    assert!(stored.completed_at.is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_cancelled_job_rejects_fail_and_complete(pool: PgPool) {
    let job = new_job("sqd");
    JobRepo::insert(&pool, &job).await.unwrap();
    assert!(JobRepo::cancel(&pool, job.id).await.unwrap());

    assert!(!JobRepo::cancel(&pool, job.id).await.unwrap());
    assert!(!JobRepo::fail(&pool, job.id, "too late").await.unwrap());
    assert!(!JobRepo::mark_started(&pool, job.id).await.unwrap());
    assert!(!JobRepo::complete(&pool, job.id, &outcome(-1.0)).await.unwrap());

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.error_message.is_none());
    assert!(stored.result_energy.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_complete_requires_running(pool: PgPool) {
    let job = new_job("vqe");
    JobRepo::insert(&pool, &job).await.unwrap();
    assert!(!JobRepo::complete(&pool, job.id, &outcome(-1.0)).await.unwrap());

    assert!(JobRepo::fail(&pool, job.id, "Failed to start: no worker").await.unwrap());
    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some("Failed to start: no worker"));
}

// ---------------------------------------------------------------------------
// Test: Progress writes
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_stale_progress_is_dropped(pool: PgPool) {
    let job = running_job(&pool).await;

    assert_eq!(
        JobRepo::update_progress(&pool, job.id, 2, 40, "Iteration 2").await.unwrap(),
        ProgressWrite::Applied
    );
    assert_eq!(
        JobRepo::update_progress(&pool, job.id, 1, 20, "Iteration 1").await.unwrap(),
        ProgressWrite::Stale
    );
    assert_eq!(
        JobRepo::update_progress(&pool, job.id, 2, 45, "Iteration 2 again").await.unwrap(),
        ProgressWrite::Stale
    );

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 40);
    assert_eq!(stored.progress_seq, 2);
    assert_eq!(stored.current_step, "Iteration 2");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_progress_never_regresses(pool: PgPool) {
    let job = running_job(&pool).await;

    JobRepo::update_progress(&pool, job.id, 1, 60, "Optimizing").await.unwrap();
    assert_eq!(
        JobRepo::update_progress(&pool, job.id, 2, 30, "Restarting ansatz").await.unwrap(),
        ProgressWrite::Applied
    );

    let stored = JobRepo::find_by_id(&pool, job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 60);
    assert_eq!(stored.progress_seq, 2);
    assert_eq!(stored.current_step, "Restarting ansatz");
}

#[sqlx::test(migrations = "./migrations")]
async fn test_progress_rejected_unless_running(pool: PgPool) {
    let pending = new_job("vqe");
    JobRepo::insert(&pool, &pending).await.unwrap();
    assert_eq!(
        JobRepo::update_progress(&pool, pending.id, 1, 10, "early").await.unwrap(),
        ProgressWrite::Rejected
    );

    let cancelled = running_job(&pool).await;
    assert!(JobRepo::cancel(&pool, cancelled.id).await.unwrap());
    assert_eq!(
        JobRepo::update_progress(&pool, cancelled.id, 1, 10, "after cancel").await.unwrap(),
        ProgressWrite::Rejected
    );

    assert_eq!(
        JobRepo::update_progress(&pool, new_job_id(), 1, 10, "nobody").await.unwrap(),
        ProgressWrite::Rejected
    );

    let stored = JobRepo::find_by_id(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 0);
    assert_eq!(stored.progress_seq, 0);
}

// ---------------------------------------------------------------------------
// Test: Queue claims
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_claim_next_hands_out_each_job_once(pool: PgPool) {
    let first = new_job("vqe");
    let second = new_job("sqd");
    JobRepo::insert(&pool, &first).await.unwrap();
    JobRepo::insert(&pool, &second).await.unwrap();

    // Neither running nor cancelled jobs are claimable.
    running_job(&pool).await;
    let cancelled = new_job("vqe");
    JobRepo::insert(&pool, &cancelled).await.unwrap();
    JobRepo::cancel(&pool, cancelled.id).await.unwrap();

    let mut claimed = HashSet::new();
    while let Some(job) = JobRepo::claim_next(&pool).await.unwrap() {
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_at.is_some());
        assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
    }
    assert_eq!(claimed, HashSet::from([first.id, second.id]));

    // Claiming does not start the job.
    let stored = JobRepo::find_by_id(&pool, first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.started_at.is_none());
    assert!(JobRepo::mark_started(&pool, first.id).await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_claims_never_overlap(pool: PgPool) {
    let mut inserted = HashSet::new();
    for _ in 0..8 {
        let job = new_job("vqe");
        JobRepo::insert(&pool, &job).await.unwrap();
        inserted.insert(job.id);
    }

    let claims: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { JobRepo::claim_next(&pool).await.unwrap() })
        })
        .collect();
    let mut claimed = HashSet::new();
    for claim in claims {
        if let Some(job) = claim.await.unwrap() {
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed, inserted);
}

// ---------------------------------------------------------------------------
// Test: Listing
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_list_filters_and_paginates_with_true_total(pool: PgPool) {
    let mut cancelled = HashSet::new();
    for i in 0..5 {
        let job = new_job("vqe");
        JobRepo::insert(&pool, &job).await.unwrap();
        if i % 2 == 0 {
            JobRepo::cancel(&pool, job.id).await.unwrap();
            cancelled.insert(job.id);
        }
    }

    let filter = |offset| JobListQuery {
        status: Some(JobStatus::Cancelled),
        limit: Some(2),
        offset: Some(offset),
    };

    let mut seen = HashSet::new();
    for (offset, expected_len) in [(0, 2), (2, 1), (4, 0)] {
        let page = JobRepo::list(&pool, &filter(offset)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.jobs.len(), expected_len);
        for job in page.jobs {
            assert_eq!(job.status, JobStatus::Cancelled);
            assert!(seen.insert(job.id));
        }
    }
    assert_eq!(seen, cancelled);

    let pending = JobRepo::list(
        &pool,
        &JobListQuery {
            status: Some(JobStatus::Pending),
            ..JobListQuery::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(pending.total, 2);
    assert!(pending.jobs.iter().all(|j| j.status == JobStatus::Pending));

    let all = JobRepo::list(&pool, &JobListQuery::default()).await.unwrap();
    assert_eq!(all.total, 5);
    assert_eq!(all.jobs.len(), 5);
    assert!(all.jobs.windows(2).all(|w| w[0].created_at >= w[1].created_at));
}

// ---------------------------------------------------------------------------
// Test: PgJobStore
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
async fn test_store_trait_delegates_to_repo(pool: PgPool) {
    let store = PgJobStore::new(pool.clone());

    let job = store.insert(&new_job("vqe")).await.unwrap();
    assert!(store.mark_started(job.id).await.unwrap());
    assert_eq!(
        store.update_progress(job.id, 1, 50, "Halfway").await.unwrap(),
        ProgressWrite::Applied
    );
    assert!(store.fail(job.id, "SCF did not converge").await.unwrap());
    assert!(!store.complete(job.id, &outcome(-1.0)).await.unwrap());

    let stored = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.progress, 50);
    assert_eq!(stored.error_message.as_deref(), Some("SCF did not converge"));
}
