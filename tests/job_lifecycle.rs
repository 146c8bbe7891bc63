use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Barrier;

use txn_reconciler::config::ReconcileConfig;
use txn_reconciler::error::{EngineError, EngineResult};
use txn_reconciler::job::{
    JobManager, JobStatus, JobStore, ManagerOptions, MemoryJobStore, ReconJob, ReconLock,
    ResultSummary,
};
use txn_reconciler::matching::{ProgressConfig, ReconcileOutcome};
use txn_reconciler::models::Record;

fn rec(pairs: &[(&str, &str)]) -> Record {
    Record::from_pairs(pairs.iter().copied())
}

fn dataset(side: &str, n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            rec(&[
                ("txn_id", format!("T{i:06}").as_str()),
                ("amount", format!("{}.00", i % 997).as_str()),
                ("source", side),
            ])
        })
        .collect()
}

fn manager_with(store: Arc<dyn JobStore>, batch: usize) -> Arc<JobManager> {
    let opts = ManagerOptions {
        progress: ProgressConfig {
            update_every: batch,
            batch_size: batch,
        },
        ..Default::default()
    };
    Arc::new(JobManager::new(store).with_options(opts))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_start_complete_lifecycle() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 100);
    let bo = dataset("bo", 500);
    let mut partner = dataset("partner", 500);
    // perturb one amount so exactly one pair mismatches
    partner[7] = rec(&[
        ("txn_id", "T000007"),
        ("amount", "99999.99"),
        ("source", "partner"),
    ]);

    let cfg = ReconcileConfig::new("txn_id", "txn_id").with_compare_pair("amount", "amount");
    let job_id = manager
        .create_job(bo, partner, cfg, "tester")
        .await
        .unwrap();
    assert_eq!(
        manager.get_job(&job_id).await.unwrap().status,
        JobStatus::Pending
    );

    let summary = manager.start_processing(&job_id).await.unwrap();
    assert_eq!(summary.total_matches, 499);
    assert_eq!(summary.total_mismatches, 1);
    assert_eq!(summary.total_bo_only, 0);
    assert_eq!(summary.total_partner_only, 0);

    let job = manager.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());
    assert_eq!(job.result_summary.unwrap(), summary);

    // full detail retrievable by id; previews bounded and flagged
    let outcome = manager.outcome(&job_id).await.unwrap();
    assert_eq!(outcome.matches.len(), 500);
    let report = manager.report(&job_id).await.unwrap();
    assert_eq!(report.matches.items.len(), 50);
    assert!(report.matches.truncated);
    assert!(!report.bo_only.truncated);

    // final progress snapshot shows completion
    let snap = manager.progress_reporter().snapshot(&job_id).unwrap();
    assert_eq!(snap.percent, 100.0);

    // the lock is gone: an identical resubmission runs to completion
    let bo = dataset("bo", 500);
    let partner = dataset("partner", 500);
    let cfg = ReconcileConfig::new("txn_id", "txn_id");
    let rerun = manager.create_job(bo, partner, cfg, "tester").await.unwrap();
    assert!(manager.start_processing(&rerun).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_is_only_valid_from_pending() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 100);
    let job_id = manager
        .create_job(
            dataset("bo", 10),
            dataset("partner", 10),
            ReconcileConfig::new("txn_id", "txn_id"),
            "tester",
        )
        .await
        .unwrap();
    manager.start_processing(&job_id).await.unwrap();
    let err = manager.start_processing(&job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_mid_processing_discards_results_and_releases_lock() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 10);
    let bo = dataset("bo", 30_000);
    let partner = dataset("partner", 30_000);
    let cfg = ReconcileConfig::new("txn_id", "txn_id");
    let job_id = manager.create_job(bo, partner, cfg, "tester").await.unwrap();

    let worker = {
        let manager = manager.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { manager.start_processing(&job_id).await })
    };

    // wait for the worker to be inside the matching loop
    loop {
        if let Some(snap) = manager.progress_reporter().snapshot(&job_id) {
            if snap.processed > 0 && snap.current_step == "matching" {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    manager.cancel_job(&job_id).await.unwrap();

    let result = worker.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled(_))));

    let job = manager.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_summary.is_none(), "partial results must be discarded");
    assert!(manager.outcome(&job_id).await.is_err());

    // lock released on cancellation: the same inputs reconcile again
    let rerun = manager
        .create_job(
            dataset("bo", 30_000),
            dataset("partner", 30_000),
            ReconcileConfig::new("txn_id", "txn_id"),
            "tester",
        )
        .await
        .unwrap();
    assert!(manager.start_processing(&rerun).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_is_refused_on_terminal_jobs() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 100);
    let job_id = manager
        .create_job(
            dataset("bo", 5),
            dataset("partner", 5),
            ReconcileConfig::new("txn_id", "txn_id"),
            "tester",
        )
        .await
        .unwrap();
    manager.start_processing(&job_id).await.unwrap();
    let err = manager.cancel_job(&job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_job_ids_are_reported() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 100);
    assert!(matches!(
        manager.get_job("ghost").await.unwrap_err(),
        EngineError::JobNotFound(_)
    ));
    assert!(matches!(
        manager.start_processing("ghost").await.unwrap_err(),
        EngineError::JobNotFound(_)
    ));
    assert!(matches!(
        manager.cancel_job("ghost").await.unwrap_err(),
        EngineError::JobNotFound(_)
    ));
}

/// Store wrapper that holds every lock acquisition at a barrier until all
/// expected contenders have arrived, making the duplicate-job race
/// deterministic.
struct GatedStore {
    inner: MemoryJobStore,
    gate: Barrier,
}

#[async_trait]
impl JobStore for GatedStore {
    async fn insert_job(&self, job: ReconJob) -> EngineResult<()> {
        self.inner.insert_job(job).await
    }
    async fn load_job(&self, job_id: &str) -> EngineResult<Option<ReconJob>> {
        self.inner.load_job(job_id).await
    }
    async fn update_status(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> EngineResult<bool> {
        self.inner.update_status(job_id, from, to, error_message).await
    }
    async fn store_result(
        &self,
        job_id: &str,
        summary: &ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<()> {
        self.inner.store_result(job_id, summary, outcome).await
    }
    async fn load_outcome(&self, job_id: &str) -> EngineResult<Option<ReconcileOutcome>> {
        self.inner.load_outcome(job_id).await
    }
    async fn try_acquire_lock(&self, lock: ReconLock) -> EngineResult<bool> {
        let acquired = self.inner.try_acquire_lock(lock).await?;
        // both contenders observe the lock table before either proceeds
        self.gate.wait().await;
        Ok(acquired)
    }
    async fn release_lock(&self, lock_key: &str, owner_id: &str) -> EngineResult<()> {
        self.inner.release_lock(lock_key, owner_id).await
    }
    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        self.inner.sweep_expired_locks(now).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_yield_one_winner() {
    let store = Arc::new(GatedStore {
        inner: MemoryJobStore::new(),
        gate: Barrier::new(2),
    });
    let manager = manager_with(store, 100);

    // identical inputs and config on both jobs: same fingerprint
    let make = |mgr: Arc<JobManager>| async move {
        mgr.create_job(
            dataset("bo", 200),
            dataset("partner", 200),
            ReconcileConfig::new("txn_id", "txn_id"),
            "tester",
        )
        .await
        .unwrap()
    };
    let job_a = make(manager.clone()).await;
    let job_b = make(manager.clone()).await;

    let (res_a, res_b) = tokio::join!(
        {
            let m = manager.clone();
            let id = job_a.clone();
            async move { m.start_processing(&id).await }
        },
        {
            let m = manager.clone();
            let id = job_b.clone();
            async move { m.start_processing(&id).await }
        }
    );

    let oks = [&res_a, &res_b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(oks, 1, "exactly one contender may process");
    let loser = if res_a.is_err() { &res_a } else { &res_b };
    assert!(matches!(
        loser.as_ref().unwrap_err(),
        EngineError::DuplicateJobInFlight { .. }
    ));

    let status_a = manager.get_job(&job_a).await.unwrap().status;
    let status_b = manager.get_job(&job_b).await.unwrap().status;
    let mut statuses = [status_a, status_b];
    statuses.sort_by_key(|s| s.as_str().to_string());
    assert_eq!(statuses, [JobStatus::Completed, JobStatus::Failed]);

    // the loser records the duplicate diagnostic
    let failed_id = if status_a == JobStatus::Failed { &job_a } else { &job_b };
    let failed = manager.get_job(failed_id).await.unwrap();
    assert!(failed
        .error_message
        .unwrap()
        .contains("duplicate in-flight job"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_job_records_error_and_frees_the_lock() {
    let manager = manager_with(Arc::new(MemoryJobStore::new()), 100);
    let job_id = manager
        .create_job(
            dataset("bo", 10),
            dataset("partner", 10),
            ReconcileConfig::new("txn_id", "txn_id"),
            "tester",
        )
        .await
        .unwrap();
    manager.fail_job(&job_id, "collaborator went away").await.unwrap();
    let job = manager.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("collaborator went away"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn janitor_sweep_reclaims_expired_leases() {
    let store = Arc::new(MemoryJobStore::new());
    let stale = ReconLock {
        lock_key: "recon:stale".into(),
        lock_type: "reconciliation".into(),
        owner_id: "crashed-worker".into(),
        acquired_at: Utc::now() - chrono::Duration::hours(2),
        expires_at: Utc::now() - chrono::Duration::hours(1),
    };
    assert!(store.try_acquire_lock(stale).await.unwrap());

    let manager = manager_with(store, 100);
    assert_eq!(manager.sweep_expired_locks().await.unwrap(), 1);
    assert_eq!(manager.sweep_expired_locks().await.unwrap(), 0);
}
