use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::{EngineError, EngineResult};
use crate::matching::{
    reconcile, MatchedPair, ProgressConfig, ReconcileControl, ReconcileOutcome,
};
use crate::models::{Record, UnmatchedRecord};
use crate::notify::{EngineEvent, EventBus};
use crate::progress::ProgressReporter;

pub mod mysql_store;
pub mod store;

pub use store::{JobStore, MemoryJobStore};

pub const LOCK_TYPE_RECONCILIATION: &str = "reconciliation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Preparing,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PREPARING" => Some(Self::Preparing),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reconciliation job row. Owned by the manager; status transitions are
/// the only mutation, and terminal states are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconJob {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: String,
    pub fingerprint: String,
    pub config: ReconcileConfig,
    pub result_summary: Option<ResultSummary>,
    pub error_message: Option<String>,
}

#[cfg(test)]
impl ReconJob {
    pub(crate) fn new_for_test(id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: id.to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            owner_id: "test".into(),
            fingerprint: "fp".into(),
            config: ReconcileConfig::new("id", "id"),
            result_summary: None,
            error_message: None,
        }
    }
}

/// Lease row guarding a (dataset fingerprint, config) combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconLock {
    pub lock_key: String,
    pub lock_type: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Client-facing counts for a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_matches: usize,
    pub total_mismatches: usize,
    pub total_bo_only: usize,
    pub total_partner_only: usize,
    pub execution_time_ms: u64,
}

/// Bounded slice of one result bucket, with a flag when rows were cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPreview<T> {
    pub items: Vec<T>,
    pub truncated: bool,
}

fn preview<T: Clone>(items: &[T], limit: usize) -> BucketPreview<T> {
    BucketPreview {
        items: items.iter().take(limit).cloned().collect(),
        truncated: items.len() > limit,
    }
}

/// Summary plus bounded previews; full detail stays retrievable by job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconReport {
    pub job_id: String,
    pub summary: ResultSummary,
    pub matches: BucketPreview<MatchedPair>,
    pub bo_only: BucketPreview<UnmatchedRecord>,
    pub partner_only: BucketPreview<UnmatchedRecord>,
}

/// SHA-256 over the canonical serialization of both extracts and the
/// config. Identical resubmissions collide here, which is what the
/// duplicate-job lock keys on.
pub fn input_fingerprint(
    bo: &[Record],
    partner: &[Record],
    config: &ReconcileConfig,
) -> EngineResult<String> {
    let mut hasher = Sha256::new();
    for part in [
        serde_json::to_vec(bo),
        serde_json::to_vec(partner),
        serde_json::to_vec(config),
    ] {
        let bytes =
            part.map_err(|e| EngineError::Processing(format!("fingerprint encoding: {e}")))?;
        hasher.update(&bytes);
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Lock lease length; a crashed worker's lock is reclaimable after this.
    pub lock_ttl_secs: i64,
    /// Preview rows per bucket in a [`ReconReport`].
    pub preview_limit: usize,
    pub progress: ProgressConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30 * 60,
            preview_limit: 50,
            progress: ProgressConfig::default(),
        }
    }
}

struct PendingInputs {
    bo: Arc<Vec<Record>>,
    partner: Arc<Vec<Record>>,
}

/// Owns the job lifecycle: creation, the PENDING → … → terminal state
/// machine, duplicate-run locking, worker execution, and progress fan-out.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    progress: Arc<ProgressReporter>,
    bus: Option<EventBus>,
    opts: ManagerOptions,
    inputs: Mutex<HashMap<String, PendingInputs>>,
    controls: Mutex<HashMap<String, ReconcileControl>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            progress: Arc::new(ProgressReporter::new()),
            bus: None,
            opts: ManagerOptions::default(),
            inputs: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.progress = Arc::new(ProgressReporter::with_bus(bus.clone()));
        self.bus = Some(bus);
        self
    }

    pub fn with_options(mut self, opts: ManagerOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn progress_reporter(&self) -> Arc<ProgressReporter> {
        self.progress.clone()
    }

    fn publish_status(&self, job_id: &str, status: JobStatus) {
        if let Some(bus) = &self.bus {
            bus.publish(EngineEvent::StatusChanged {
                job_id: job_id.to_string(),
                status,
            });
        }
    }

    /// Validate and persist a new PENDING job. Processing does not start
    /// here; call [`start_processing`](Self::start_processing) next.
    pub async fn create_job(
        &self,
        bo: Vec<Record>,
        partner: Vec<Record>,
        config: ReconcileConfig,
        owner_id: &str,
    ) -> EngineResult<String> {
        if bo.is_empty() || partner.is_empty() {
            return Err(EngineError::InvalidConfig(
                "both extracts must contain at least one record".into(),
            ));
        }
        config.validate()?;

        let fingerprint = input_fingerprint(&bo, &partner, &config)?;
        let now = Utc::now();
        let job = ReconJob {
            job_id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            owner_id: owner_id.to_string(),
            fingerprint,
            config,
            result_summary: None,
            error_message: None,
        };
        let job_id = job.job_id.clone();
        self.store.insert_job(job).await?;
        self.inputs.lock().expect("inputs map poisoned").insert(
            job_id.clone(),
            PendingInputs {
                bo: Arc::new(bo),
                partner: Arc::new(partner),
            },
        );
        info!("[job {}] created (PENDING)", job_id);
        self.publish_status(&job_id, JobStatus::Pending);
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> EngineResult<ReconJob> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Summary plus bounded bucket previews for a completed job.
    pub async fn report(&self, job_id: &str) -> EngineResult<ReconReport> {
        let job = self.get_job(job_id).await?;
        let summary = job.result_summary.ok_or_else(|| {
            EngineError::Processing(format!("job {job_id} has no stored result"))
        })?;
        let outcome = self
            .store
            .load_outcome(job_id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("job {job_id} result detail missing")))?;
        let limit = self.opts.preview_limit;
        Ok(ReconReport {
            job_id: job_id.to_string(),
            summary,
            matches: preview(&outcome.matches, limit),
            bo_only: preview(&outcome.bo_only, limit),
            partner_only: preview(&outcome.partner_only, limit),
        })
    }

    /// Full bucket detail for a completed job.
    pub async fn outcome(&self, job_id: &str) -> EngineResult<ReconcileOutcome> {
        self.store
            .load_outcome(job_id)
            .await?
            .ok_or_else(|| EngineError::Storage(format!("job {job_id} result detail missing")))
    }

    fn lock_key(fingerprint: &str) -> String {
        format!("recon:{fingerprint}")
    }

    /// Acquire the duplicate-run lock and drive the job to a terminal
    /// state. At most one concurrent run per (inputs, config) fingerprint:
    /// losers fail fast with [`EngineError::DuplicateJobInFlight`].
    pub async fn start_processing(&self, job_id: &str) -> EngineResult<ResultSummary> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Preparing.to_string(),
            });
        }

        let lock_key = Self::lock_key(&job.fingerprint);
        let now = Utc::now();
        let lock = ReconLock {
            lock_key: lock_key.clone(),
            lock_type: LOCK_TYPE_RECONCILIATION.to_string(),
            owner_id: job_id.to_string(),
            acquired_at: now,
            expires_at: now + ChronoDuration::seconds(self.opts.lock_ttl_secs),
        };
        if !self.store.try_acquire_lock(lock).await? {
            let msg = format!(
                "duplicate in-flight job for fingerprint {}",
                job.fingerprint
            );
            warn!("[job {}] refused: {}", job_id, msg);
            self.store
                .update_status(job_id, &[JobStatus::Pending], JobStatus::Failed, Some(msg))
                .await?;
            self.publish_status(job_id, JobStatus::Failed);
            self.discard_inputs(job_id);
            return Err(EngineError::DuplicateJobInFlight {
                fingerprint: job.fingerprint,
            });
        }

        // Lock held from here on: every exit path below must release it.
        let result = self.run_locked(&job).await;
        if let Err(e) = self.store.release_lock(&lock_key, job_id).await {
            warn!("[job {}] lock release failed: {}", job_id, e);
        }
        self.discard_inputs(job_id);
        self.controls.lock().expect("controls map poisoned").remove(job_id);

        match &result {
            Ok(summary) => info!(
                "[job {}] completed: {} matched, {} mismatched, {} bo-only, {} partner-only in {} ms",
                job_id,
                summary.total_matches,
                summary.total_mismatches,
                summary.total_bo_only,
                summary.total_partner_only,
                summary.execution_time_ms
            ),
            Err(e) => info!("[job {}] finished without result: {}", job_id, e),
        }
        result
    }

    async fn run_locked(&self, job: &ReconJob) -> EngineResult<ResultSummary> {
        let job_id = job.job_id.clone();

        if !self
            .store
            .update_status(&job_id, &[JobStatus::Pending], JobStatus::Preparing, None)
            .await?
        {
            // cancelled between create and start
            return Err(EngineError::Cancelled(format!(
                "job {job_id} left PENDING before preparation"
            )));
        }
        self.publish_status(&job_id, JobStatus::Preparing);

        let (bo, partner) = {
            let inputs = self.inputs.lock().expect("inputs map poisoned");
            let pending = inputs.get(&job_id).ok_or_else(|| {
                EngineError::Processing(format!("job {job_id} inputs no longer staged"))
            })?;
            (pending.bo.clone(), pending.partner.clone())
        };

        let ctrl = ReconcileControl::new();
        self.controls
            .lock()
            .expect("controls map poisoned")
            .insert(job_id.clone(), ctrl.clone());

        if !self
            .store
            .update_status(&job_id, &[JobStatus::Preparing], JobStatus::Processing, None)
            .await?
        {
            return Err(EngineError::Cancelled(format!(
                "job {job_id} cancelled during preparation"
            )));
        }
        self.publish_status(&job_id, JobStatus::Processing);

        let config = job.config.clone();
        let pcfg = self.opts.progress;
        let reporter = self.progress.clone();
        let worker_job_id = job_id.clone();
        let started = Instant::now();

        // The matcher loop is synchronous CPU work; run it off the async
        // executor. Cancellation reaches it through the shared control flag.
        let run = tokio::task::spawn_blocking(move || {
            reconcile(
                &bo,
                &partner,
                &config,
                pcfg,
                |u| reporter.report(&worker_job_id, u.processed, u.total, u.stage),
                Some(&ctrl),
            )
        })
        .await;

        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(EngineError::Cancelled(reason))) => {
                // partial results are discarded; cancel_job already moved the
                // status, this path only covers a worker that set the flag
                // itself before the status write landed
                self.store
                    .update_status(
                        &job_id,
                        &[JobStatus::Processing],
                        JobStatus::Cancelled,
                        None,
                    )
                    .await?;
                return Err(EngineError::Cancelled(reason));
            }
            Ok(Err(e)) => return self.fail_inner(&job_id, e).await,
            Err(join_err) => {
                let e = EngineError::Processing(format!("matcher worker crashed: {join_err}"));
                return self.fail_inner(&job_id, e).await;
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let summary = ResultSummary {
            total_matches: outcome.clean_match_count(),
            total_mismatches: outcome.mismatch_count(),
            total_bo_only: outcome.bo_only.len(),
            total_partner_only: outcome.partner_only.len(),
            execution_time_ms: elapsed_ms,
        };
        self.complete_inner(&job_id, summary, &outcome).await
    }

    async fn complete_inner(
        &self,
        job_id: &str,
        summary: ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<ResultSummary> {
        if !self
            .store
            .update_status(job_id, &[JobStatus::Processing], JobStatus::Completed, None)
            .await?
        {
            // cancelled after the final batch: discard, store nothing
            return Err(EngineError::Cancelled(format!(
                "job {job_id} cancelled at completion"
            )));
        }
        self.store.store_result(job_id, &summary, outcome).await?;
        self.publish_status(job_id, JobStatus::Completed);
        Ok(summary)
    }

    async fn fail_inner(&self, job_id: &str, error: EngineError) -> EngineResult<ResultSummary> {
        let msg = error.to_string();
        let moved = self
            .store
            .update_status(
                job_id,
                &[JobStatus::Pending, JobStatus::Preparing, JobStatus::Processing],
                JobStatus::Failed,
                Some(msg),
            )
            .await?;
        if moved {
            self.publish_status(job_id, JobStatus::Failed);
        }
        Err(error)
    }

    /// Record an externally produced result. Normally the worker calls this
    /// path itself; exposed for collaborators that run the matcher out of
    /// process.
    pub async fn complete_job(
        &self,
        job_id: &str,
        summary: ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<()> {
        let job = self.get_job(job_id).await?;
        self.complete_inner(job_id, summary, outcome).await?;
        self.store
            .release_lock(&Self::lock_key(&job.fingerprint), job_id)
            .await?;
        Ok(())
    }

    /// Mark a job FAILED with the given message and release its lock.
    pub async fn fail_job(&self, job_id: &str, error: &str) -> EngineResult<()> {
        let job = self.get_job(job_id).await?;
        self.store
            .update_status(
                job_id,
                &[JobStatus::Pending, JobStatus::Preparing, JobStatus::Processing],
                JobStatus::Failed,
                Some(error.to_string()),
            )
            .await?;
        self.publish_status(job_id, JobStatus::Failed);
        self.store
            .release_lock(&Self::lock_key(&job.fingerprint), job_id)
            .await?;
        self.discard_inputs(job_id);
        Ok(())
    }

    /// Cancel a non-terminal job. A running worker observes the flag at its
    /// next batch boundary and discards partial results.
    pub async fn cancel_job(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }
        let moved = self
            .store
            .update_status(
                job_id,
                &[JobStatus::Pending, JobStatus::Preparing, JobStatus::Processing],
                JobStatus::Cancelled,
                None,
            )
            .await?;
        if !moved {
            let job = self.get_job(job_id).await?;
            return Err(EngineError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Cancelled.to_string(),
            });
        }
        if let Some(ctrl) = self
            .controls
            .lock()
            .expect("controls map poisoned")
            .get(job_id)
        {
            ctrl.cancel();
        }
        info!("[job {}] cancelled", job_id);
        self.publish_status(job_id, JobStatus::Cancelled);
        self.discard_inputs(job_id);
        Ok(())
    }

    fn discard_inputs(&self, job_id: &str) {
        self.inputs.lock().expect("inputs map poisoned").remove(job_id);
    }

    /// One janitor pass over the lock table.
    pub async fn sweep_expired_locks(&self) -> EngineResult<usize> {
        self.store.sweep_expired_locks(Utc::now()).await
    }
}

/// Periodic lease reclamation so a crashed worker cannot block
/// resubmission forever. Runs until the returned handle is aborted.
pub fn spawn_lock_janitor(
    manager: Arc<JobManager>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match manager.sweep_expired_locks().await {
                Ok(0) => {}
                Ok(n) => info!("[janitor] reclaimed {} expired lock(s)", n),
                Err(e) => warn!("[janitor] sweep failed: {}", e),
            }
        }
    })
}
