use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::Stage;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::store::JobStore;

/// Writes the complete finding set in one call.
pub struct PersistStage {
    store: Arc<dyn JobStore>,
}

impl PersistStage {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for PersistStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id, findings = ctx.findings.len()))]
    async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        self.store.set_findings(&ctx.job_id, &ctx.findings).await?;
        debug!("findings persisted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Persist"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Finding, Severity};
    use crate::sandbox::Sandbox;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn overwrites_previous_findings() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::open(dir.path()).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let id = store.create_job("https://github.com/o/r").await.unwrap();

        let finding = |id: &str| Finding {
            vulnerability_id: id.to_string(),
            severity: Severity::Critical,
            package_name: None,
            package_id: None,
            installed_version: None,
            fixed_version: None,
            status: None,
            title: None,
            description: None,
            primary_url: None,
            references: vec![],
        };
        store
            .set_findings(&id, &[finding("CVE-OLD-1"), finding("CVE-OLD-2")])
            .await
            .unwrap();

        let mut ctx = JobContext::new(id.clone(), "https://github.com/o/r", sandbox);
        ctx.findings = vec![finding("CVE-NEW")];
        PersistStage::new(store.clone()).run(&mut ctx).await.unwrap();

        let job = store.get_job(&id).await.unwrap().unwrap();
        assert_eq!(job.findings, vec![finding("CVE-NEW")]);
    }

    #[tokio::test]
    async fn unknown_job_is_a_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::open(dir.path()).await.unwrap();
        let mut ctx = JobContext::new("ghost".parse().unwrap(), "https://github.com/o/r", sandbox);
        let err = PersistStage::new(Arc::new(MemoryStore::new()))
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PersistenceFailure");
    }
}
