use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{JobStore, StoreResult};
use crate::error::StoreError;
use crate::job::{Finding, JobId, ScanJob, ScanStatus};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, ScanJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: &JobId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut ScanJob) -> StoreResult<()> + Send,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        f(job)?;
        job.updated_at = Utc::now();
        Ok(())
    }
}

fn transition(job: &mut ScanJob, next: ScanStatus) -> StoreResult<()> {
    if !job.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            id: job.id.clone(),
            from: job.status,
            to: next,
        });
    }
    job.status = next;
    Ok(())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, repository: &str) -> StoreResult<JobId> {
        let id = JobId::generate();
        let job = ScanJob::queued(id.clone(), repository);
        self.jobs.write().await.insert(id.clone(), job);
        Ok(id)
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<ScanJob>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn set_status(&self, id: &JobId, status: ScanStatus) -> StoreResult<()> {
        self.update(id, |job| transition(job, status)).await
    }

    async fn set_findings(&self, id: &JobId, findings: &[Finding]) -> StoreResult<()> {
        let findings = findings.to_vec();
        self.update(id, move |job| {
            job.findings = findings;
            Ok(())
        })
        .await
    }

    async fn record_failure(&self, id: &JobId, reason: &str) -> StoreResult<()> {
        let reason = reason.to_string();
        self.update(id, move |job| {
            transition(job, ScanStatus::Failed)?;
            job.failure = Some(reason);
            Ok(())
        })
        .await
    }

    async fn list_jobs(&self, status: Option<ScanStatus>) -> StoreResult<Vec<ScanJob>> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<ScanJob> = jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listed)
    }
}
