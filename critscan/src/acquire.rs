use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::AcquireConfig;
use crate::error::PipelineError;
use crate::job::JobId;
use crate::repo_ref::{RepositoryPolicy, RepositoryRef};
use crate::sandbox::Sandbox;

pub const REPOS_DIR: &str = "repos";

/// A shallow clone living inside the sandbox, owned by one job.
#[derive(Debug, Clone)]
pub struct StagedRepository {
    pub reference: RepositoryRef,
    pub path: PathBuf,
}

/// Clones allow-listed repositories into per-job staging directories.
#[derive(Debug, Clone)]
pub struct GitAcquirer {
    policy: RepositoryPolicy,
    git_program: String,
    timeout: Duration,
    capture_limit: usize,
}

impl GitAcquirer {
    pub fn new(config: &AcquireConfig) -> Self {
        Self {
            policy: RepositoryPolicy::from_config(config),
            git_program: config.git_program.clone(),
            timeout: config.timeout(),
            capture_limit: config.capture_limit,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RepositoryPolicy {
        &self.policy
    }

    /// Directory a job's clone is staged in.
    pub fn staging_dir(sandbox: &Sandbox, job_id: &JobId) -> PathBuf {
        sandbox.root().join(REPOS_DIR).join(job_id.as_str())
    }

    /// Validate `reference` and shallow-clone it for `job_id`.
    ///
    /// Nothing touches the filesystem or spawns a process until the reference
    /// has passed the policy.
    #[instrument(skip(self, sandbox), fields(job_id = %job_id))]
    pub async fn acquire(
        &self,
        sandbox: &Sandbox,
        job_id: &JobId,
        reference: &str,
    ) -> Result<StagedRepository, PipelineError> {
        let reference = self.policy.validate(reference)?;

        let target = Self::staging_dir(sandbox, job_id);
        // Leftovers from a crashed attempt of the same job.
        sandbox.remove_dir(&target).await?;
        sandbox.create_dir(sandbox.root().join(REPOS_DIR)).await?;
        let target = sandbox.confine_dir(&target)?;

        info!(repository = %reference, target = %target.display(), "cloning repository");
        match tokio::time::timeout(self.timeout, self.clone_into(&reference, &target)).await {
            Ok(Ok(())) => {
                debug!(repository = %reference, "clone complete");
                Ok(StagedRepository {
                    reference,
                    path: target,
                })
            }
            Ok(Err(e)) => {
                self.discard_partial(sandbox, &target).await;
                Err(e)
            }
            Err(_) => {
                warn!(repository = %reference, timeout_secs = self.timeout.as_secs(), "clone timed out");
                self.discard_partial(sandbox, &target).await;
                Err(PipelineError::AcquisitionTimeout {
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn clone_into(&self, reference: &RepositoryRef, target: &Path) -> Result<(), PipelineError> {
        let mut command = Command::new(&self.git_program);
        command
            .args(["clone", "--depth", "1", "--single-branch", "--no-tags", "--"])
            .arg(reference.clone_url())
            .arg(target)
            .env("GIT_TERMINAL_PROMPT", "0");

        let output = crate::process::run_captured(command, self.capture_limit)
            .await
            .map_err(|e| {
                PipelineError::AcquisitionFailed(
                    anyhow!(e).context(format!("failed to run {}", self.git_program)),
                )
            })?;

        if output.success() {
            return Ok(());
        }
        Err(PipelineError::AcquisitionFailed(anyhow!(
            "git clone of {} exited with {:?}\n{}",
            reference.full_name(),
            output.exit_code(),
            output.tail()
        )))
    }

    async fn discard_partial(&self, sandbox: &Sandbox, target: &Path) {
        if let Err(e) = sandbox.remove_dir(target).await {
            warn!(target = %target.display(), error = %e, "failed to remove partial clone");
        }
    }
}
