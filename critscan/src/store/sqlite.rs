use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::{JobStore, StoreResult};
use crate::error::StoreError;
use crate::job::{Finding, JobId, ScanJob, ScanStatus};

const SELECT_JOB: &str = "SELECT id, repository, status, findings, failure, created_at, updated_at FROM scan_jobs";

/// Job records in a SQLite database, migrated on connect.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    repository: String,
    status: String,
    findings: String,
    failure: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JobRow> for ScanJob {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> anyhow::Result<Self> {
        Ok(ScanJob {
            id: row.id.parse()?,
            repository: row.repository,
            status: row.status.parse()?,
            findings: serde_json::from_str(&row.findings)
                .with_context(|| format!("corrupt findings for job {}", row.id))?,
            failure: row.failure,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

impl SqliteStore {
    /// Connect to `url` (for example `sqlite://critscan.db?mode=rwc`) and run
    /// pending migrations.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .with_context(|| format!("failed to open database {url}"))?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database. One connection, since every SQLite
    /// in-memory connection is its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn current_status(&self, id: &JobId) -> StoreResult<ScanStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM scan_jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match status {
            Some(raw) => Ok(raw.parse()?),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    /// Move `id` to `next` with the transition check inside the `UPDATE`
    /// predicate. `failure` is written in the same statement.
    async fn transition(&self, id: &JobId, next: ScanStatus, failure: Option<&str>) -> StoreResult<()> {
        let allowed = ScanStatus::predecessors(next);
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let sql = format!(
            "UPDATE scan_jobs SET status = ?, failure = COALESCE(?, failure), updated_at = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(failure)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str());
        for status in &allowed {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            debug!(job_id = %id, status = %next, "status written");
            return Ok(());
        }
        let from = self.current_status(id).await?;
        Err(StoreError::InvalidTransition {
            id: id.clone(),
            from,
            to: next,
        })
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip(self))]
    async fn create_job(&self, repository: &str) -> StoreResult<JobId> {
        let job = ScanJob::queued(JobId::generate(), repository);
        sqlx::query(
            "INSERT INTO scan_jobs (id, repository, status, findings, failure, created_at, updated_at) \
             VALUES (?, ?, ?, '[]', NULL, ?, ?)",
        )
        .bind(job.id.as_str())
        .bind(&job.repository)
        .bind(job.status.as_str())
        .bind(timestamp(job.created_at))
        .bind(timestamp(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(job.id)
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<ScanJob>> {
        let row: Option<JobRow> = sqlx::query_as(&format!("{SELECT_JOB} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScanJob::try_from).transpose().map_err(StoreError::from)
    }

    async fn set_status(&self, id: &JobId, status: ScanStatus) -> StoreResult<()> {
        self.transition(id, status, None).await
    }

    async fn set_findings(&self, id: &JobId, findings: &[Finding]) -> StoreResult<()> {
        let encoded = serde_json::to_string(findings).map_err(|e| anyhow!(e))?;
        let result = sqlx::query("UPDATE scan_jobs SET findings = ?, updated_at = ? WHERE id = ?")
            .bind(encoded)
            .bind(timestamp(Utc::now()))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.clone()));
        }
        Ok(())
    }

    async fn record_failure(&self, id: &JobId, reason: &str) -> StoreResult<()> {
        self.transition(id, ScanStatus::Failed, Some(reason)).await
    }

    async fn list_jobs(&self, status: Option<ScanStatus>) -> StoreResult<Vec<ScanJob>> {
        let rows: Vec<JobRow> = match status {
            Some(status) => {
                sqlx::query_as(&format!("{SELECT_JOB} WHERE status = ? ORDER BY created_at, rowid"))
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as(&format!("{SELECT_JOB} ORDER BY created_at, rowid"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|row| ScanJob::try_from(row).map_err(StoreError::from))
            .collect()
    }
}
