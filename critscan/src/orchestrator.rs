//! Per-job state machine: `Queued -> Scanning -> {Finished, Failed}`.
//!
//! Every status write completes before the next stage starts. Staged
//! artifacts are released on every exit path before the terminal status is
//! written; release failures are logged and never change the outcome.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::acquire::GitAcquirer;
use crate::config::Config;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::job::{Finding, JobId, ScanJob, ScanStatus};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::sandbox::Sandbox;
use crate::scanner::ScannerInvoker;
use crate::stages::{AcquireStage, ExtractStage, PersistStage, ScanStage};
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Finished { findings: Vec<Finding> },
    /// The job was already Finished or Failed; nothing was done.
    AlreadyTerminal { status: ScanStatus },
}

/// Drives single scan jobs through the pipeline.
#[derive(Clone)]
pub struct ScanJobProcessor {
    store: Arc<dyn JobStore>,
    sandbox: Sandbox,
    pipeline: Pipeline,
}

impl ScanJobProcessor {
    pub fn new(store: Arc<dyn JobStore>, sandbox: Sandbox, pipeline: Pipeline) -> Self {
        Self {
            store,
            sandbox,
            pipeline,
        }
    }

    /// Processor with the standard acquire, scan, extract and persist stages.
    pub fn from_config(config: &Config, store: Arc<dyn JobStore>, sandbox: Sandbox) -> Self {
        let pipeline = default_pipeline(config, store.clone());
        Self::new(store, sandbox, pipeline)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run one delivered job to a terminal state.
    ///
    /// Only setup problems (unknown job, store unreachable before work
    /// starts) return without a status write. Stage failures are written as
    /// `Failed` and then returned so the caller can nack the delivery.
    #[instrument(skip(self, job_id, repository), fields(job_id = %job_id))]
    pub async fn process_scan_job(
        &self,
        job_id: &JobId,
        repository: &str,
    ) -> Result<JobOutcome, PipelineError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.clone()))?;

        if job.status.is_terminal() {
            info!(status = %job.status, "job already terminal, skipping");
            return Ok(JobOutcome::AlreadyTerminal { status: job.status });
        }
        if job.repository != repository {
            warn!(stored = %job.repository, delivered = %repository, "delivered repository differs from job record");
        }

        self.store.set_status(job_id, ScanStatus::Scanning).await?;
        info!(repository = %repository, "scan started");

        let mut ctx = JobContext::new(job_id.clone(), repository, self.sandbox.clone());
        let result = match self.store.set_findings(job_id, &[]).await {
            Ok(()) => self.pipeline.run(&mut ctx).await,
            Err(e) => Err(e.into()),
        };

        for e in ctx.artifacts.release().await {
            warn!(error = %e, "cleanup failed");
        }

        match result {
            Ok(()) => self.finish(ctx).await,
            Err(e) => {
                self.fail(job_id, &e).await;
                Err(e)
            }
        }
    }

    async fn finish(&self, ctx: JobContext) -> Result<JobOutcome, PipelineError> {
        if let Err(e) = self.store.set_status(&ctx.job_id, ScanStatus::Finished).await {
            let e = PipelineError::from(e);
            self.fail(&ctx.job_id, &e).await;
            return Err(e);
        }
        info!(findings = ctx.findings.len(), "scan finished");
        Ok(JobOutcome::Finished {
            findings: ctx.findings,
        })
    }

    /// Record `cause` as the job's failure. A failed job keeps no findings,
    /// even if the persist stage already wrote them.
    async fn fail(&self, job_id: &JobId, cause: &PipelineError) {
        warn!(kind = cause.kind(), error = %cause, "scan failed");
        if let Err(e) = self.store.set_findings(job_id, &[]).await {
            error!(error = %e, "failed to clear findings of failed job");
        }
        if let Err(e) = self.store.record_failure(job_id, &cause.diagnostic()).await {
            error!(error = %e, "failed to record job failure");
        }
    }

    /// Create a job for `repository`, process it right away and return the
    /// final record.
    ///
    /// Stage failures end up on the returned record. Errors that left the
    /// job short of a terminal state (store unreachable, Scanning write
    /// rejected) are returned instead.
    pub async fn scan_now(&self, repository: &str) -> Result<ScanJob, PipelineError> {
        let job_id = self.store.create_job(repository).await?;
        let result = self.process_scan_job(&job_id, repository).await;
        let job = self
            .store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.clone()))?;
        match result {
            Err(e) if !job.status.is_terminal() => Err(e),
            _ => Ok(job),
        }
    }
}

pub fn default_pipeline(config: &Config, store: Arc<dyn JobStore>) -> Pipeline {
    PipelineBuilder::new()
        .stage(AcquireStage::new(GitAcquirer::new(&config.acquire)))
        .stage(ScanStage::new(
            ScannerInvoker::new(&config.scanner),
            config.scanner.timeout(),
        ))
        .stage(ExtractStage)
        .stage(PersistStage::new(store))
        .build()
}
