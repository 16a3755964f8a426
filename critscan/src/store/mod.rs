mod memory;
mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{Finding, JobId, ScanJob, ScanStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable record of scan jobs.
///
/// Implementations enforce [`ScanStatus::can_transition_to`] on every status
/// write, so a terminal job can never be moved again.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, repository: &str) -> StoreResult<JobId>;

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<ScanJob>>;

    async fn set_status(&self, id: &JobId, status: ScanStatus) -> StoreResult<()>;

    /// Replace the job's findings with `findings`.
    async fn set_findings(&self, id: &JobId, findings: &[Finding]) -> StoreResult<()>;

    /// Move the job to `Failed` and keep `reason` on the record.
    async fn record_failure(&self, id: &JobId, reason: &str) -> StoreResult<()>;

    /// Jobs in creation order, optionally limited to one status.
    async fn list_jobs(&self, status: Option<ScanStatus>) -> StoreResult<Vec<ScanJob>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store must share, run against each implementation.

    use super::*;
    use crate::job::Severity;

    pub fn finding(id: &str) -> Finding {
        Finding {
            vulnerability_id: id.to_string(),
            severity: Severity::Critical,
            package_name: Some("lodash".to_string()),
            package_id: None,
            installed_version: Some("4.17.15".to_string()),
            fixed_version: Some("4.17.21".to_string()),
            status: None,
            title: None,
            description: None,
            primary_url: None,
            references: vec![],
        }
    }

    pub async fn create_and_get(store: &dyn JobStore) {
        let id = store.create_job("https://github.com/o/r").await.unwrap();
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.repository, "https://github.com/o/r");
        assert_eq!(job.status, ScanStatus::Queued);
        assert!(job.findings.is_empty());
        assert!(job.failure.is_none());

        let unknown: JobId = "missing".parse().unwrap();
        assert!(store.get_job(&unknown).await.unwrap().is_none());
    }

    pub async fn transitions_are_enforced(store: &dyn JobStore) {
        let id = store.create_job("https://github.com/o/r").await.unwrap();

        let err = store.set_status(&id, ScanStatus::Finished).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.set_status(&id, ScanStatus::Scanning).await.unwrap();
        store.set_status(&id, ScanStatus::Scanning).await.unwrap();
        store.set_status(&id, ScanStatus::Finished).await.unwrap();

        for next in ScanStatus::ALL {
            let err = store.set_status(&id, next).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidTransition { .. }), "{next}");
        }
        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, ScanStatus::Finished);
    }

    pub async fn unknown_job_is_not_found(store: &dyn JobStore) {
        let id: JobId = "ghost".parse().unwrap();
        assert!(matches!(
            store.set_status(&id, ScanStatus::Scanning).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_findings(&id, &[]).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.record_failure(&id, "x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    pub async fn findings_are_overwritten(store: &dyn JobStore) {
        let id = store.create_job("https://github.com/o/r").await.unwrap();
        store
            .set_findings(&id, &[finding("CVE-1"), finding("CVE-2")])
            .await
            .unwrap();
        store.set_findings(&id, &[finding("CVE-3")]).await.unwrap();

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.findings, vec![finding("CVE-3")]);
    }

    pub async fn failure_is_recorded(store: &dyn JobStore) {
        let id = store.create_job("https://github.com/o/r").await.unwrap();
        store.set_status(&id, ScanStatus::Scanning).await.unwrap();
        store.record_failure(&id, "ScanTimeout: too slow").await.unwrap();

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, ScanStatus::Failed);
        assert_eq!(job.failure.as_deref(), Some("ScanTimeout: too slow"));
        assert!(store.record_failure(&id, "again").await.is_err());
    }

    pub async fn list_filters_by_status(store: &dyn JobStore) {
        let a = store.create_job("https://github.com/o/a").await.unwrap();
        let b = store.create_job("https://github.com/o/b").await.unwrap();
        store.set_status(&b, ScanStatus::Scanning).await.unwrap();

        let all = store.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let queued = store.list_jobs(Some(ScanStatus::Queued)).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a);
    }
}
