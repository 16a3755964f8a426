use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, warn};

use super::Stage;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::scanner::ScannerInvoker;

/// Runs the scanner under an overall wall-clock ceiling. Expiry drops the
/// invocation, which kills the child process.
pub struct ScanStage {
    invoker: ScannerInvoker,
    timeout: Duration,
}

impl ScanStage {
    pub fn new(invoker: ScannerInvoker, timeout: Duration) -> Self {
        Self { invoker, timeout }
    }
}

#[async_trait]
impl Stage for ScanStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        let Some(staged) = &ctx.staged else {
            return Err(PipelineError::ScanExecutionFailed {
                exit_code: None,
                signal: None,
                detail: "no staged repository to scan".to_string(),
                output_tail: String::new(),
            });
        };
        let source = staged.path.clone();
        ctx.artifacts
            .track_file(ScannerInvoker::report_path(&ctx.sandbox, &ctx.job_id));

        let invocation = self.invoker.invoke(&ctx.sandbox, &ctx.job_id, &source);
        match tokio::time::timeout(self.timeout, invocation).await {
            Ok(report) => {
                ctx.report = Some(report?);
                Ok(())
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "scanner timed out");
                Err(PipelineError::ScanTimeout {
                    timeout: self.timeout,
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "Scan"
    }
}
