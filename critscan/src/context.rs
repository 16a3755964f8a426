use std::path::PathBuf;

use futures::future::join_all;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::acquire::StagedRepository;
use crate::error::SandboxError;
use crate::job::{Finding, JobId};
use crate::sandbox::Sandbox;

/// Per-invocation state threaded through the stages of one job.
#[derive(Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub repository: String,
    pub sandbox: Sandbox,
    pub staged: Option<StagedRepository>,
    pub report: Option<PathBuf>,
    pub findings: Vec<Finding>,
    pub artifacts: StagedArtifacts,
}

impl JobContext {
    pub fn new(job_id: JobId, repository: impl Into<String>, sandbox: Sandbox) -> Self {
        Self {
            job_id,
            repository: repository.into(),
            artifacts: StagedArtifacts::new(sandbox.clone()),
            sandbox,
            staged: None,
            report: None,
            findings: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Dir,
    File,
}

/// Paths a job has (or may have) created inside the sandbox.
///
/// Paths are registered before the work that creates them starts, so a
/// partially written clone or report is covered too. [`StagedArtifacts::release`]
/// is the normal path; if the guard is dropped unreleased (cancelled or
/// panicking job) `Drop` removes the artifacts synchronously.
#[derive(Debug)]
pub struct StagedArtifacts {
    sandbox: Sandbox,
    paths: Vec<(PathBuf, ArtifactKind)>,
    released: bool,
}

impl StagedArtifacts {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox,
            paths: vec![],
            released: false,
        }
    }

    pub fn track_dir(&mut self, path: impl Into<PathBuf>) {
        self.track(path.into(), ArtifactKind::Dir);
    }

    pub fn track_file(&mut self, path: impl Into<PathBuf>) {
        self.track(path.into(), ArtifactKind::File);
    }

    fn track(&mut self, path: PathBuf, kind: ArtifactKind) {
        if !self.paths.iter().any(|(p, _)| *p == path) {
            self.paths.push((path, kind));
        }
        self.released = false;
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Remove every tracked artifact. All removals are attempted; the
    /// failures are returned for the caller to log.
    pub async fn release(&mut self) -> Vec<SandboxError> {
        let sandbox = &self.sandbox;
        let removals = self.paths.iter().map(|(path, kind)| async move {
            match kind {
                ArtifactKind::Dir => sandbox.remove_dir(path).await,
                ArtifactKind::File => sandbox.remove_file(path).await,
            }
        });
        let errors = join_all(removals)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        self.paths.clear();
        self.released = true;
        errors
    }
}

impl StagedArtifacts {
    fn remove_all_blocking(&mut self) {
        for (path, kind) in self.paths.drain(..).rev() {
            if let Err(e) = self.sandbox.remove_blocking(&path, kind == ArtifactKind::Dir) {
                warn!(path = %path.display(), error = %e, "failed to remove staged artifact");
            }
        }
    }
}

impl Drop for StagedArtifacts {
    /// Removal stays synchronous so nothing outlives the guard. On a
    /// multi-threaded runtime the worker hands its other tasks off first
    /// (`block_in_place`); elsewhere the removal runs inline.
    fn drop(&mut self) {
        if self.released || self.paths.is_empty() {
            return;
        }
        debug!(count = self.paths.len(), "releasing artifacts from drop");
        let on_worker = Handle::try_current()
            .is_ok_and(|handle| matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread));
        if on_worker {
            tokio::task::block_in_place(|| self.remove_all_blocking());
        } else {
            self.remove_all_blocking();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::open(dir.path()).await.unwrap();
        (dir, sandbox)
    }

    #[tokio::test]
    async fn release_removes_dirs_and_files() {
        let (_dir, sandbox) = sandbox().await;
        let repo = sandbox.create_dir("repos/job").await.unwrap();
        std::fs::write(repo.join("package.json"), "{}").unwrap();
        sandbox.create_dir("reports").await.unwrap();
        let report = sandbox.root().join("reports/report_job.json");
        std::fs::write(&report, "{}").unwrap();

        let mut artifacts = StagedArtifacts::new(sandbox.clone());
        artifacts.track_dir(&repo);
        artifacts.track_file(&report);
        artifacts.track_dir(&repo);
        assert_eq!(artifacts.len(), 2);

        assert!(artifacts.release().await.is_empty());
        assert!(!repo.exists());
        assert!(!report.exists());
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn missing_artifacts_release_cleanly() {
        let (_dir, sandbox) = sandbox().await;
        let mut artifacts = StagedArtifacts::new(sandbox.clone());
        artifacts.track_dir(sandbox.root().join("repos/never-cloned"));
        artifacts.track_file(sandbox.root().join("reports/never-written.json"));
        assert!(artifacts.release().await.is_empty());
    }

    #[tokio::test]
    async fn unsafe_artifacts_are_reported_not_removed() {
        let (dir, sandbox) = sandbox().await;
        let mut artifacts = StagedArtifacts::new(sandbox.clone());
        artifacts.track_dir(sandbox.root());
        let errors = artifacts.release().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SandboxError::UnsafePath { .. }));
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn drop_without_release_cleans_up() {
        let (_dir, sandbox) = sandbox().await;
        let repo = sandbox.create_dir("repos/dropped").await.unwrap();
        {
            let mut artifacts = StagedArtifacts::new(sandbox.clone());
            artifacts.track_dir(&repo);
        }
        assert!(!repo.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_on_multi_thread_runtime_cleans_up() {
        let (_dir, sandbox) = sandbox().await;
        let repo = sandbox.create_dir("repos/threaded").await.unwrap();
        std::fs::write(repo.join("index.js"), "1").unwrap();

        let guard = {
            let sandbox = sandbox.clone();
            let repo = repo.clone();
            tokio::spawn(async move {
                let mut artifacts = StagedArtifacts::new(sandbox);
                artifacts.track_dir(&repo);
            })
        };
        guard.await.unwrap();
        assert!(!repo.exists());
    }

    #[test]
    fn drop_outside_runtime_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("sandbox");
        let repo = root.join("repos/plain");
        std::fs::create_dir_all(&repo).unwrap();
        let sandbox = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(Sandbox::open(&root))
            .unwrap();

        let mut artifacts = StagedArtifacts::new(sandbox);
        artifacts.track_dir(&repo);
        drop(artifacts);
        assert!(!repo.exists());
    }

    #[tokio::test]
    async fn cancelled_job_future_still_cleans_up() {
        let (_dir, sandbox) = sandbox().await;
        let repo = sandbox.create_dir("repos/cancelled").await.unwrap();

        let mut ctx = JobContext::new("cancelled".parse().unwrap(), "https://github.com/o/r", sandbox);
        ctx.artifacts.track_dir(&repo);
        let work = async move {
            let _ctx = ctx;
            std::future::pending::<()>().await;
        };
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), work).await;

        assert!(!repo.exists());
    }
}
