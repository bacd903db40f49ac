use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use docket_core::{
    defaults, ledger, new_v7,
    scheduling::{saturated_tenants, select_next},
    CancelOutcome, Error, HeartbeatAck, Job, JobFilter, JobRepository, LeasePolicy,
    NewAuditEvent, NewJob, QueueStats, ResourceRequirements, Result, SchedulerPolicy, TenantLoad,
    WorkerCapabilities,
};

use super::{insert_audit, parse_col};

/// Advisory lock key serializing lease decisions across processes.
const LEASE_LOCK_KEY: i64 = 0x646f_636b_6574;

const JOB_COLUMNS: &str = "id, tenant_id, actor_id, job_type, document_ref, priority, memory_mb, \
     exclusive_accelerator, status, parameters, result_ref, last_error, progress_percent, \
     progress_step, retry_count, max_retries, worker_id, lease_expires_at, available_at, \
     cancel_requested, archived, created_at, started_at, completed_at";

/// PostgreSQL implementation of JobRepository.
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: PgRow) -> Result<Job> {
        let memory_mb: i32 = row.get("memory_mb");
        Ok(Job {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            actor_id: row.get("actor_id"),
            job_type: parse_col(row.get("job_type"))?,
            document_ref: row.get("document_ref"),
            priority: row.get("priority"),
            resources: ResourceRequirements {
                memory_mb: memory_mb.max(0) as u32,
                exclusive_accelerator: row.get("exclusive_accelerator"),
            },
            status: parse_col(row.get("status"))?,
            parameters: row.get("parameters"),
            result_ref: row.get("result_ref"),
            last_error: row.get("last_error"),
            progress_percent: row.get("progress_percent"),
            progress_step: row.get("progress_step"),
            retry_count: row.get("retry_count"),
            max_retries: row.get("max_retries"),
            worker_id: row.get("worker_id"),
            lease_expires_at: row.get("lease_expires_at"),
            available_at: row.get("available_at"),
            cancel_requested: row.get("cancel_requested"),
            archived: row.get("archived"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn lock_job(conn: &mut PgConnection, job_id: Uuid) -> Result<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(conn)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::JobNotFound(job_id))?;
        Self::parse_job_row(row)
    }

    async fn insert_row(conn: &mut PgConnection, job: &Job) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO jobs ({JOB_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22, $23, $24)"
        ))
        .bind(job.id)
        .bind(&job.tenant_id)
        .bind(&job.actor_id)
        .bind(job.job_type.as_str())
        .bind(&job.document_ref)
        .bind(job.priority)
        .bind(job.resources.memory_mb as i32)
        .bind(job.resources.exclusive_accelerator)
        .bind(job.status.as_str())
        .bind(&job.parameters)
        .bind(&job.result_ref)
        .bind(&job.last_error)
        .bind(job.progress_percent)
        .bind(&job.progress_step)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(&job.worker_id)
        .bind(job.lease_expires_at)
        .bind(job.available_at)
        .bind(job.cancel_requested)
        .bind(job.archived)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(conn)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Persist the mutable columns of a job.
    async fn write_row(conn: &mut PgConnection, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE jobs
             SET status = $2, result_ref = $3, last_error = $4, progress_percent = $5,
                 progress_step = $6, retry_count = $7, worker_id = $8, lease_expires_at = $9,
                 available_at = $10, cancel_requested = $11, archived = $12,
                 started_at = $13, completed_at = $14
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(&job.result_ref)
        .bind(&job.last_error)
        .bind(job.progress_percent)
        .bind(&job.progress_step)
        .bind(job.retry_count)
        .bind(&job.worker_id)
        .bind(job.lease_expires_at)
        .bind(job.available_at)
        .bind(job.cancel_requested)
        .bind(job.archived)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(conn)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Lock, mutate, audit and commit one job.
    async fn mutate<T, F>(&self, job_id: Uuid, now: DateTime<Utc>, f: F) -> Result<(T, Job)>
    where
        F: FnOnce(&mut Job) -> Result<(T, Option<NewAuditEvent>)> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        let (out, event) = f(&mut job)?;
        Self::write_row(&mut tx, &job).await?;
        if let Some(event) = event {
            insert_audit(&mut tx, event, now).await?;
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok((out, job))
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, new: NewJob, now: DateTime<Utc>) -> Result<(Job, bool)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if new.dedupe {
            let dedupe_key = format!("{}|{}|{}", new.tenant_id, new.job_type, new.document_ref);
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(&dedupe_key)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;

            let existing = sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE tenant_id = $1 AND job_type = $2 AND document_ref = $3
                   AND status NOT IN ('completed', 'failed')
                 ORDER BY created_at
                 LIMIT 1"
            ))
            .bind(&new.tenant_id)
            .bind(new.job_type.as_str())
            .bind(&new.document_ref)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if let Some(row) = existing {
                tx.commit().await.map_err(Error::Database)?;
                return Ok((Self::parse_job_row(row)?, true));
            }
        }

        let job = Job::from_new(new_v7(), new, now);
        Self::insert_row(&mut tx, &job).await?;
        insert_audit(&mut tx, ledger::created(&job), now).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok((job, false))
    }

    async fn lease_next(
        &self,
        caps: &WorkerCapabilities,
        policy: &LeasePolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Fairness needs the global running count, so lease decisions are
        // serialized rather than SKIP LOCKED.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(LEASE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let load_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT tenant_id, COUNT(*) FROM jobs WHERE status = 'running' GROUP BY tenant_id",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let load: TenantLoad = load_rows
            .into_iter()
            .map(|(t, n)| (t, n.max(0) as u32))
            .collect();

        let saturated = saturated_tenants(&load, policy);

        let type_strings: Vec<String> = caps
            .job_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        // Tenants at quota are excluded and each tenant contributes only its
        // head rows, so one deep backlog cannot crowd others out of the
        // candidate set.
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM (
                 SELECT *, ROW_NUMBER() OVER (
                     PARTITION BY tenant_id ORDER BY priority DESC, created_at, id
                 ) AS tenant_rank
                 FROM jobs
                 WHERE status IN ('queued', 'retrying')
                   AND available_at <= $1
                   AND NOT cancel_requested
                   AND NOT archived
                   AND memory_mb <= $2
                   AND (NOT exclusive_accelerator OR $3)
                   AND (cardinality($4::text[]) = 0 OR job_type = ANY($4))
                   AND NOT (tenant_id = ANY($5::text[]))
             ) ranked
             WHERE tenant_rank <= $6
             ORDER BY priority DESC, created_at, id"
        ))
        .bind(now)
        .bind(caps.memory_mb as i32)
        .bind(caps.has_accelerator)
        .bind(&type_strings)
        .bind(&saturated)
        .bind(defaults::LEASE_CANDIDATES_PER_TENANT)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let candidates = rows
            .into_iter()
            .map(Self::parse_job_row)
            .collect::<Result<Vec<_>>>()?;

        let Some(picked) = select_next(&candidates, caps, &load, policy, now) else {
            return Ok(None);
        };
        let mut job = picked.clone();
        let event = ledger::lease(&mut job, &caps.worker_id, policy.lease_duration, now)?;
        Self::write_row(&mut tx, &job).await?;
        insert_audit(&mut tx, event, now).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(job_id = %job.id, worker_id = %caps.worker_id, "Leased job");
        Ok(Some(job))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatAck> {
        let (deadline, job) = self
            .mutate(job_id, now, |job| {
                Ok((ledger::heartbeat(job, worker_id, lease_duration, now)?, None))
            })
            .await?;
        Ok(HeartbeatAck {
            lease_expires_at: deadline,
            cancel_requested: job.cancel_requested,
        })
    }

    async fn report_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        percent: i32,
        step: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(job_id, now, |job| {
            Ok(((), Some(ledger::progress(job, worker_id, percent, step)?)))
        })
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let ((), job) = self
            .mutate(job_id, now, |job| {
                Ok(((), Some(ledger::complete(job, worker_id, result_ref, now)?)))
            })
            .await?;
        Ok(job)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
        policy: &SchedulerPolicy,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let ((), job) = self
            .mutate(job_id, now, |job| {
                let event = ledger::fail(job, worker_id, error, retryable, policy, now)?;
                Ok(((), Some(event)))
            })
            .await?;
        Ok(job)
    }

    async fn cancel(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(CancelOutcome, Job)> {
        self.mutate(job_id, now, |job| {
            if job.tenant_id != tenant_id {
                return Err(Error::JobNotFound(job_id));
            }
            let (outcome, event) = ledger::cancel(job, actor_id, now)?;
            Ok((outcome, Some(event)))
        })
        .await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'running' AND lease_expires_at <= $1
             ORDER BY lease_expires_at
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Self::parse_job_row(row)?;
            let event = ledger::reclaim(&mut job, now)?;
            Self::write_row(&mut tx, &job).await?;
            insert_audit(&mut tx, event, now).await?;
            reclaimed.push(job);
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(reclaimed)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn list(
        &self,
        tenant_id: &str,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE tenant_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR job_type = $3)
               AND ($4 OR NOT archived)
             ORDER BY created_at DESC, id DESC
             LIMIT $5 OFFSET $6"
        ))
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.include_archived)
        .bind(limit)
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn stats(&self, tenant_id: Option<&str>, now: DateTime<Utc>) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'retrying') AS retrying,
                COUNT(*) FILTER (WHERE status = 'completed' AND completed_at >= $2) AS completed_last_hour,
                COUNT(*) FILTER (WHERE status = 'failed' AND completed_at >= $2) AS failed_last_hour,
                COUNT(*) AS total
             FROM jobs
             WHERE ($1::text IS NULL OR tenant_id = $1)",
        )
        .bind(tenant_id)
        .bind(now - Duration::hours(1))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            queued: row.get("queued"),
            running: row.get("running"),
            retrying: row.get("retrying"),
            completed_last_hour: row.get("completed_last_hour"),
            failed_last_hour: row.get("failed_last_hour"),
            total: row.get("total"),
        })
    }

    async fn archive_idle(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status IN ('completed', 'failed') AND NOT archived AND completed_at < $1
             ORDER BY completed_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let mut archived = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = Self::parse_job_row(row)?;
            let event = ledger::archive(&mut job)?;
            Self::write_row(&mut tx, &job).await?;
            insert_audit(&mut tx, event, now).await?;
            archived.push(job);
        }
        tx.commit().await.map_err(Error::Database)?;
        Ok(archived)
    }
}
