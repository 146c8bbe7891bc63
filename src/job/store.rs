use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{JobStatus, ReconJob, ReconLock, ResultSummary};
use crate::error::{EngineError, EngineResult};
use crate::matching::ReconcileOutcome;

/// Durable store for job and lock rows. The engine owns no global tables;
/// everything goes through an injected implementation of this trait.
///
/// `try_acquire_lock` must be atomic insert-if-absent-or-expired, and
/// `update_status` must be a conditional write (applied only when the
/// current status is one of `from`) — these two are the store's whole
/// concurrency contract.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: ReconJob) -> EngineResult<()>;

    async fn load_job(&self, job_id: &str) -> EngineResult<Option<ReconJob>>;

    /// Move `job_id` to `to` iff its current status is in `from`, updating
    /// `updated_at` and (when given) the error message. Returns whether the
    /// transition applied.
    async fn update_status(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> EngineResult<bool>;

    /// Persist a completed run's summary and full bucket detail.
    async fn store_result(
        &self,
        job_id: &str,
        summary: &ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<()>;

    async fn load_outcome(&self, job_id: &str) -> EngineResult<Option<ReconcileOutcome>>;

    /// Atomically take the lock unless an unexpired row already holds the
    /// same key. Returns whether this caller now owns the lock.
    async fn try_acquire_lock(&self, lock: ReconLock) -> EngineResult<bool>;

    async fn release_lock(&self, lock_key: &str, owner_id: &str) -> EngineResult<()>;

    /// Reclaim lapsed leases; returns how many were removed.
    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> EngineResult<usize>;
}

#[derive(Default)]
struct MemoryTables {
    jobs: HashMap<String, ReconJob>,
    outcomes: HashMap<String, ReconcileOutcome>,
    locks: HashMap<String, ReconLock>,
}

/// Mutex-guarded tables. The default store for tests and single-process
/// deployments.
#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tables(&self) -> EngineResult<std::sync::MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| EngineError::Storage("memory store poisoned".into()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: ReconJob) -> EngineResult<()> {
        let mut t = self.lock_tables()?;
        if t.jobs.contains_key(&job.job_id) {
            return Err(EngineError::Storage(format!(
                "job {} already exists",
                job.job_id
            )));
        }
        t.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> EngineResult<Option<ReconJob>> {
        Ok(self.lock_tables()?.jobs.get(job_id).cloned())
    }

    async fn update_status(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> EngineResult<bool> {
        let mut t = self.lock_tables()?;
        let job = t
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        job.updated_at = Utc::now();
        if error_message.is_some() {
            job.error_message = error_message;
        }
        Ok(true)
    }

    async fn store_result(
        &self,
        job_id: &str,
        summary: &ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<()> {
        let mut t = self.lock_tables()?;
        let job = t
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        job.result_summary = Some(summary.clone());
        job.updated_at = Utc::now();
        t.outcomes.insert(job_id.to_string(), outcome.clone());
        Ok(())
    }

    async fn load_outcome(&self, job_id: &str) -> EngineResult<Option<ReconcileOutcome>> {
        Ok(self.lock_tables()?.outcomes.get(job_id).cloned())
    }

    async fn try_acquire_lock(&self, lock: ReconLock) -> EngineResult<bool> {
        let mut t = self.lock_tables()?;
        if let Some(existing) = t.locks.get(&lock.lock_key) {
            if existing.expires_at > Utc::now() {
                return Ok(false);
            }
            // expired lease from a crashed worker; reclaim in place
        }
        t.locks.insert(lock.lock_key.clone(), lock);
        Ok(true)
    }

    async fn release_lock(&self, lock_key: &str, owner_id: &str) -> EngineResult<()> {
        let mut t = self.lock_tables()?;
        if t.locks.get(lock_key).map(|l| l.owner_id == owner_id) == Some(true) {
            t.locks.remove(lock_key);
        }
        Ok(())
    }

    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut t = self.lock_tables()?;
        let before = t.locks.len();
        t.locks.retain(|_, l| l.expires_at > now);
        Ok(before - t.locks.len())
    }
}
