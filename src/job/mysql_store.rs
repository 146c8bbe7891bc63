use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};
use std::time::Duration;

use super::{JobStatus, JobStore, ReconJob, ReconLock, ResultSummary};
use crate::error::{EngineError, EngineResult};
use crate::matching::ReconcileOutcome;

fn storage_err(context: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(format!("{context}: {e}"))
}

/// Build a MySQL pool with env-tunable sizing.
pub async fn make_pool(url: &str) -> EngineResult<MySqlPool> {
    let max_conn: u32 = std::env::var("TXN_RECON_POOL_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| {
            let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8) as u32;
            std::cmp::min(32, cores.saturating_mul(2))
        });
    let acquire_ms: u64 = std::env::var("TXN_RECON_ACQUIRE_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5_000);

    MySqlPoolOptions::new()
        .max_connections(max_conn.max(1))
        .acquire_timeout(Duration::from_millis(acquire_ms))
        .connect(url)
        .await
        .map_err(|e| storage_err("connect", e))
}

/// Durable job/lock store over MySQL. Lock acquisition is
/// delete-expired-then-insert: the primary key on `lock_key` makes the
/// insert the atomic check-and-set.
pub struct MySqlJobStore {
    pool: MySqlPool,
}

impl MySqlJobStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the three engine tables when absent.
    pub async fn init_schema(&self) -> EngineResult<()> {
        for ddl in [
            r#"CREATE TABLE IF NOT EXISTS recon_jobs (
                job_id VARCHAR(64) PRIMARY KEY,
                status VARCHAR(16) NOT NULL,
                created_at DATETIME(3) NOT NULL,
                updated_at DATETIME(3) NOT NULL,
                owner_id VARCHAR(128) NOT NULL,
                fingerprint CHAR(64) NOT NULL,
                config TEXT NOT NULL,
                result_summary TEXT NULL,
                error_message TEXT NULL,
                KEY idx_recon_jobs_fingerprint (fingerprint)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS recon_results (
                job_id VARCHAR(64) PRIMARY KEY,
                outcome LONGTEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS recon_locks (
                lock_key VARCHAR(191) PRIMARY KEY,
                lock_type VARCHAR(32) NOT NULL,
                owner_id VARCHAR(64) NOT NULL,
                acquired_at DATETIME(3) NOT NULL,
                expires_at DATETIME(3) NOT NULL
            )"#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_err("init schema", e))?;
        }
        Ok(())
    }

    fn row_to_job(row: &sqlx::mysql::MySqlRow) -> EngineResult<ReconJob> {
        let status_text: String = row.try_get("status").map_err(|e| storage_err("read status", e))?;
        let status = JobStatus::parse(&status_text)
            .ok_or_else(|| EngineError::Storage(format!("unknown status `{status_text}`")))?;
        let config_text: String = row.try_get("config").map_err(|e| storage_err("read config", e))?;
        let config = serde_json::from_str(&config_text)
            .map_err(|e| storage_err("decode config", e))?;
        let summary_text: Option<String> = row
            .try_get("result_summary")
            .map_err(|e| storage_err("read result_summary", e))?;
        let result_summary = match summary_text {
            Some(text) => {
                Some(serde_json::from_str(&text).map_err(|e| storage_err("decode summary", e))?)
            }
            None => None,
        };
        Ok(ReconJob {
            job_id: row.try_get("job_id").map_err(|e| storage_err("read job_id", e))?,
            status,
            created_at: row
                .try_get("created_at")
                .map_err(|e| storage_err("read created_at", e))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| storage_err("read updated_at", e))?,
            owner_id: row.try_get("owner_id").map_err(|e| storage_err("read owner_id", e))?,
            fingerprint: row
                .try_get("fingerprint")
                .map_err(|e| storage_err("read fingerprint", e))?,
            config,
            result_summary,
            error_message: row
                .try_get("error_message")
                .map_err(|e| storage_err("read error_message", e))?,
        })
    }
}

#[async_trait]
impl JobStore for MySqlJobStore {
    async fn insert_job(&self, job: ReconJob) -> EngineResult<()> {
        let config = serde_json::to_string(&job.config).map_err(|e| storage_err("encode config", e))?;
        sqlx::query(
            r#"INSERT INTO recon_jobs
               (job_id, status, created_at, updated_at, owner_id, fingerprint, config)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.job_id)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.owner_id)
        .bind(&job.fingerprint)
        .bind(config)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("insert job", e))?;
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> EngineResult<Option<ReconJob>> {
        let row = sqlx::query("SELECT * FROM recon_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("load job", e))?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn update_status(
        &self,
        job_id: &str,
        from: &[JobStatus],
        to: JobStatus,
        error_message: Option<String>,
    ) -> EngineResult<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE recon_jobs
             SET status = ?, updated_at = ?, error_message = COALESCE(?, error_message)
             WHERE job_id = ? AND status IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(Utc::now())
            .bind(error_message)
            .bind(job_id);
        for s in from {
            q = q.bind(s.as_str());
        }
        let res = q
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("update status", e))?;
        if res.rows_affected() > 0 {
            return Ok(true);
        }
        // distinguish a lost CAS from a missing row
        if self.load_job(job_id).await?.is_none() {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        Ok(false)
    }

    async fn store_result(
        &self,
        job_id: &str,
        summary: &ResultSummary,
        outcome: &ReconcileOutcome,
    ) -> EngineResult<()> {
        let summary_text =
            serde_json::to_string(summary).map_err(|e| storage_err("encode summary", e))?;
        let outcome_text =
            serde_json::to_string(outcome).map_err(|e| storage_err("encode outcome", e))?;
        sqlx::query("UPDATE recon_jobs SET result_summary = ?, updated_at = ? WHERE job_id = ?")
            .bind(summary_text)
            .bind(Utc::now())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("store summary", e))?;
        sqlx::query(
            "INSERT INTO recon_results (job_id, outcome) VALUES (?, ?)
             ON DUPLICATE KEY UPDATE outcome = VALUES(outcome)",
        )
        .bind(job_id)
        .bind(outcome_text)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_err("store outcome", e))?;
        Ok(())
    }

    async fn load_outcome(&self, job_id: &str) -> EngineResult<Option<ReconcileOutcome>> {
        let row = sqlx::query("SELECT outcome FROM recon_results WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_err("load outcome", e))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let text: String =
                    row.try_get("outcome").map_err(|e| storage_err("read outcome", e))?;
                let outcome =
                    serde_json::from_str(&text).map_err(|e| storage_err("decode outcome", e))?;
                Ok(Some(outcome))
            }
        }
    }

    async fn try_acquire_lock(&self, lock: ReconLock) -> EngineResult<bool> {
        sqlx::query("DELETE FROM recon_locks WHERE lock_key = ? AND expires_at <= ?")
            .bind(&lock.lock_key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("reclaim expired lock", e))?;
        let res = sqlx::query(
            r#"INSERT INTO recon_locks (lock_key, lock_type, owner_id, acquired_at, expires_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&lock.lock_key)
        .bind(&lock.lock_type)
        .bind(&lock.owner_id)
        .bind(lock.acquired_at)
        .bind(lock.expires_at)
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(true),
            // lost the race or an unexpired holder exists
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(e) => Err(storage_err("acquire lock", e)),
        }
    }

    async fn release_lock(&self, lock_key: &str, owner_id: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM recon_locks WHERE lock_key = ? AND owner_id = ?")
            .bind(lock_key)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("release lock", e))?;
        Ok(())
    }

    async fn sweep_expired_locks(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let res = sqlx::query("DELETE FROM recon_locks WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_err("sweep locks", e))?;
        Ok(res.rows_affected() as usize)
    }
}
