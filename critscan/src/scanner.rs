use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::config::ScannerConfig;
use crate::error::PipelineError;
use crate::job::JobId;
use crate::sandbox::Sandbox;

pub const REPORTS_DIR: &str = "reports";

/// Runs the external analysis tool for one job and hands back its report.
#[derive(Debug, Clone)]
pub struct ScannerInvoker {
    program: String,
    args: Vec<String>,
    capture_limit: usize,
}

impl ScannerInvoker {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            capture_limit: config.capture_limit,
        }
    }

    pub fn report_file_name(job_id: &JobId) -> String {
        format!("report_{job_id}.json")
    }

    pub fn report_path(sandbox: &Sandbox, job_id: &JobId) -> PathBuf {
        sandbox
            .root()
            .join(REPORTS_DIR)
            .join(Self::report_file_name(job_id))
    }

    fn render_args(&self, source: &Path, reports: &Path, job_id: &JobId) -> Vec<String> {
        let source = source.to_string_lossy();
        let reports = reports.to_string_lossy();
        let report_file = Self::report_file_name(job_id);
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{reports}", &reports)
                    .replace("{report_file}", &report_file)
                    .replace("{job_id}", job_id.as_str())
            })
            .collect()
    }

    /// Scan the staged tree at `source` and return the path of the report.
    ///
    /// The path is only returned once the process exited cleanly and the
    /// report exists as a regular file inside the sandbox.
    #[instrument(skip(self, sandbox, source), fields(job_id = %job_id))]
    pub async fn invoke(
        &self,
        sandbox: &Sandbox,
        job_id: &JobId,
        source: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let source = sandbox.confine_dir(source)?;
        let reports = sandbox.create_dir(REPORTS_DIR).await?;
        let report = Self::report_path(sandbox, job_id);
        sandbox.remove_file(&report).await?;

        let args = self.render_args(&source, &reports, job_id);
        let detail = format!("{} {}", self.program, args.join(" "));
        info!(command = %detail, "starting scanner");

        let mut command = Command::new(&self.program);
        command.args(&args);

        let output = crate::process::run_captured(command, self.capture_limit)
            .await
            .map_err(|e| PipelineError::ScanExecutionFailed {
                exit_code: None,
                signal: None,
                detail: format!("failed to start {}: {e}", self.program),
                output_tail: String::new(),
            })?;

        if !output.success() {
            warn!(code = ?output.exit_code(), signal = ?output.signal(), "scanner exited unsuccessfully");
            return Err(PipelineError::ScanExecutionFailed {
                exit_code: output.exit_code(),
                signal: output.signal(),
                detail,
                output_tail: output.tail(),
            });
        }

        let report = sandbox.confine_file(&report)?;
        match tokio::fs::metadata(&report).await {
            Ok(meta) if meta.is_file() => Ok(report),
            _ => Err(PipelineError::ScanExecutionFailed {
                exit_code: output.exit_code(),
                signal: None,
                detail: format!("scanner exited cleanly but wrote no report at {}", report.display()),
                output_tail: output.tail(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker(program: &str, args: &[&str]) -> ScannerInvoker {
        ScannerInvoker::new(&ScannerConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..ScannerConfig::default()
        })
    }

    async fn staged() -> (tempfile::TempDir, Sandbox, PathBuf, JobId) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::open(dir.path()).await.unwrap();
        let source = sandbox.create_dir("repos/job-7").await.unwrap();
        (dir, sandbox, source, "job-7".parse().unwrap())
    }

    #[test]
    fn default_template_mounts_source_read_only() {
        let invoker = ScannerInvoker::new(&ScannerConfig::default());
        let job: JobId = "j1".parse().unwrap();
        let args = invoker.render_args(Path::new("/sb/repos/j1"), Path::new("/sb/reports"), &job);
        assert!(args.contains(&"/sb/repos/j1:/work:ro".to_string()));
        assert!(args.contains(&"/sb/reports:/reports".to_string()));
        assert!(args.contains(&"/reports/report_j1.json".to_string()));
    }

    #[test]
    fn report_names_are_unique_per_job() {
        let a: JobId = "a".parse().unwrap();
        let b: JobId = "b".parse().unwrap();
        assert_ne!(
            ScannerInvoker::report_file_name(&a),
            ScannerInvoker::report_file_name(&b)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn returns_report_written_by_tool() {
        let (_dir, sandbox, source, job) = staged().await;
        let invoker = invoker("sh", &["-c", "echo '{\"Results\":[]}' > {reports}/{report_file}"]);

        let report = invoker.invoke(&sandbox, &job, &source).await.unwrap();
        assert_eq!(report, ScannerInvoker::report_path(&sandbox, &job));
        assert!(report.is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_code_and_tail() {
        let (_dir, sandbox, source, job) = staged().await;
        let invoker = invoker("sh", &["-c", "echo 'db download failed' >&2; exit 4"]);

        let err = invoker.invoke(&sandbox, &job, &source).await.unwrap_err();
        match err {
            PipelineError::ScanExecutionFailed {
                exit_code,
                output_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(4));
                assert!(output_tail.contains("db download failed"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_report_is_a_failure() {
        let (_dir, sandbox, source, job) = staged().await;
        let invoker = invoker("sh", &["-c", "true"]);

        let err = invoker.invoke(&sandbox, &job, &source).await.unwrap_err();
        assert!(matches!(err, PipelineError::ScanExecutionFailed { exit_code: Some(0), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_report_from_previous_attempt_is_not_returned() {
        let (_dir, sandbox, source, job) = staged().await;
        sandbox.create_dir(REPORTS_DIR).await.unwrap();
        let stale = ScannerInvoker::report_path(&sandbox, &job);
        std::fs::write(&stale, "{}").unwrap();

        let invoker = invoker("sh", &["-c", "true"]);
        assert!(invoker.invoke(&sandbox, &job, &source).await.is_err());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn source_outside_sandbox_is_rejected() {
        let (dir, sandbox, _source, job) = staged().await;
        let outside = dir.path().parent().unwrap().to_path_buf();
        let invoker = invoker("sh", &["-c", "true"]);

        let err = invoker.invoke(&sandbox, &job, &outside).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsafePath { .. }));
    }
}
