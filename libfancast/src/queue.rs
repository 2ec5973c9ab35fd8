//! Durable job queue
//!
//! At-least-once delivery over the jobs table. A claim flips a job to
//! `active` and stamps a visibility deadline; if the worker dies before
//! acking, the reaper returns the job to `waiting` once the deadline
//! passes. Failed attempts are redelivered with exponential backoff and
//! jitter until the attempt cap, after which the job parks in terminal
//! `failed` where an operator can inspect and retry it by hand.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::{DbError, QueueError, Result};
use crate::types::{Job, JobKind, JobPayload, JobStatus};

/// Result of offering a job to the queue. `Unavailable` means the
/// backend could not take it right now; callers handle that as "not
/// scheduled", never as a crash.
#[derive(Debug)]
pub enum Enqueue {
    Accepted(i64),
    Unavailable(String),
}

/// What happened to a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivery scheduled after this many seconds.
    Retrying { delay_secs: u64 },
    /// Attempt cap reached (or the error was not retryable); the job
    /// is parked in terminal `failed`.
    Dead,
}

/// Per-status job counts for operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueMetrics {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

/// Backend reachability with probe timing.
#[derive(Debug, serde::Serialize)]
pub struct QueueHealth {
    pub reachable: bool,
    pub latency_ms: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    config: QueueConfig,
}

/// An exclusively claimed job. Consume with [`JobLease::ack`] or
/// [`JobLease::fail`]; a lease that is neither acked nor failed is
/// redelivered after its visibility deadline.
pub struct JobLease {
    pub job: Job,
    db: Database,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// Offer a job. `run_at` delays the first delivery; `None` means
    /// eligible immediately.
    pub async fn enqueue(&self, payload: &JobPayload, run_at: Option<i64>) -> Enqueue {
        let encoded = match serde_json::to_string(payload) {
            Ok(encoded) => encoded,
            Err(e) => return Enqueue::Unavailable(format!("payload encoding failed: {}", e)),
        };

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (kind, payload, status, attempts, run_at, created_at, updated_at)
            VALUES (?, ?, 'waiting', 0, ?, ?, ?)
            "#,
        )
        .bind(payload.kind().as_str())
        .bind(&encoded)
        .bind(run_at)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(job_id = id, kind = %payload.kind(), "job enqueued");
                Enqueue::Accepted(id)
            }
            Err(e) => {
                warn!(error = %e, kind = %payload.kind(), "queue backend refused enqueue");
                Enqueue::Unavailable(e.to_string())
            }
        }
    }

    /// Claim the next eligible job of the given kinds, if any. The
    /// claim is a single conditional UPDATE, so two workers polling
    /// concurrently can never lease the same job.
    pub async fn claim(&self, kinds: &[JobKind], now: i64) -> Result<Option<JobLease>> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE jobs SET
                status = 'active',
                attempts = attempts + 1,
                visibility_deadline = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE kind IN ({})
                  AND status IN ('waiting', 'delayed')
                  AND (run_at IS NULL OR run_at <= ?)
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, kind, payload, status, attempts, last_error,
                      run_at, visibility_deadline, created_at, updated_at
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(now + self.config.visibility_timeout_secs as i64)
            .bind(now);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        let query = query.bind(now);

        let row = query
            .fetch_optional(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| JobLease {
            job: row_to_job(r),
            db: self.db.clone(),
            config: self.config.clone(),
        }))
    }

    /// Return expired `active` jobs to circulation. Jobs already at the
    /// attempt cap go terminal instead of looping forever.
    pub async fn reap_expired(&self, now: i64) -> Result<u64> {
        let dead = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'failed',
                last_error = 'worker lost: visibility deadline passed at attempt cap',
                visibility_deadline = NULL,
                updated_at = ?
            WHERE status = 'active' AND visibility_deadline <= ? AND attempts >= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(self.config.max_attempts)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let reaped = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'waiting',
                visibility_deadline = NULL,
                updated_at = ?
            WHERE status = 'active' AND visibility_deadline <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let total = dead.rows_affected() + reaped.rows_affected();
        if total > 0 {
            info!(
                redelivered = reaped.rows_affected(),
                dead = dead.rows_affected(),
                "reaped expired job leases"
            );
        }
        Ok(total)
    }

    /// Operator retry of a terminally failed job. Attempts are kept so
    /// the history stays honest; the job gets exactly one more delivery
    /// per retry call.
    pub async fn retry(&self, job_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'waiting', run_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(job_id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id).into());
        }

        info!(job_id, "failed job returned to the queue by operator");
        Ok(())
    }

    /// Drop all terminally failed jobs. Returns how many were removed.
    pub async fn clear_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs WHERE status = 'failed'
            "#,
        )
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM jobs GROUP BY status
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut metrics = QueueMetrics {
            waiting: 0,
            active: 0,
            completed: 0,
            failed: 0,
            delayed: 0,
        };
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Waiting) => metrics.waiting = count,
                Some(JobStatus::Active) => metrics.active = count,
                Some(JobStatus::Completed) => metrics.completed = count,
                Some(JobStatus::Failed) => metrics.failed = count,
                Some(JobStatus::Delayed) => metrics.delayed = count,
                None => {}
            }
        }

        Ok(metrics)
    }

    /// Most recently failed jobs, newest first.
    pub async fn recent_failed(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload, status, attempts, last_error,
                   run_at, visibility_deadline, created_at, updated_at
            FROM jobs
            WHERE status = 'failed'
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(row_to_job).collect())
    }

    /// Cheap liveness probe of the queue backend.
    pub async fn healthy(&self) -> bool {
        self.health().await.reachable
    }

    /// Liveness probe with timing, for the admin surfaces.
    pub async fn health(&self) -> QueueHealth {
        let started = std::time::Instant::now();
        let reachable = sqlx::query("SELECT 1")
            .execute(self.db.pool())
            .await
            .is_ok();
        QueueHealth {
            reachable,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl JobLease {
    /// Mark the job done. Guarded on `active` so a late ack after
    /// redelivery is a no-op.
    pub async fn ack(self) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'completed', visibility_deadline = NULL, updated_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(self.job.id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        debug!(job_id = self.job.id, "job completed");
        Ok(())
    }

    /// Record a failed attempt. Retryable failures under the attempt
    /// cap are redelivered after a backoff delay; everything else goes
    /// terminal.
    pub async fn fail(self, error: &str, retryable: bool, now: i64) -> Result<FailOutcome> {
        if !retryable || self.job.attempts >= self.config.max_attempts {
            sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'failed', last_error = ?, visibility_deadline = NULL, updated_at = ?
                WHERE id = ? AND status = 'active'
                "#,
            )
            .bind(error)
            .bind(now)
            .bind(self.job.id)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

            warn!(
                job_id = self.job.id,
                attempts = self.job.attempts,
                error,
                "job failed terminally"
            );
            return Ok(FailOutcome::Dead);
        }

        let delay_secs = backoff_delay(
            self.job.attempts,
            self.config.base_delay_secs,
            self.config.max_delay_secs,
        );
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'delayed', last_error = ?, run_at = ?,
                visibility_deadline = NULL, updated_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(error)
        .bind(now + delay_secs as i64)
        .bind(now)
        .bind(self.job.id)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        info!(
            job_id = self.job.id,
            attempt = self.job.attempts,
            delay_secs,
            error,
            "job attempt failed, retrying after backoff"
        );
        Ok(FailOutcome::Retrying { delay_secs })
    }
}

/// Exponential backoff with equal jitter: the deterministic half of the
/// capped exponential delay plus a random half, so retries spread out
/// without ever firing unreasonably early.
fn backoff_delay(attempt: u32, base_secs: u64, max_secs: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let exp_delay = base_secs.saturating_mul(1u64 << exponent).min(max_secs);
    let half = exp_delay / 2;
    half + rand::thread_rng().gen_range(0..=half.max(1))
}

fn row_to_job(r: sqlx::sqlite::SqliteRow) -> Job {
    use sqlx::Row;

    Job {
        id: r.get("id"),
        kind: JobKind::parse(&r.get::<String, _>("kind")).unwrap_or(JobKind::Publish),
        payload: r.get("payload"),
        status: JobStatus::parse(&r.get::<String, _>("status")).unwrap_or(JobStatus::Waiting),
        attempts: r.get::<i64, _>("attempts") as u32,
        last_error: r.get("last_error"),
        run_at: r.get("run_at"),
        visibility_deadline: r.get("visibility_deadline"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
