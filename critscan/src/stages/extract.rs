use async_trait::async_trait;
use tracing::{info, instrument};

use super::Stage;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::report;
use crate::scanner::ScannerInvoker;

pub struct ExtractStage;

#[async_trait]
impl Stage for ExtractStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        let Some(path) = ctx.report.clone() else {
            return Err(PipelineError::ReportParseFailed {
                path: ScannerInvoker::report_path(&ctx.sandbox, &ctx.job_id),
                source: "no report was produced".into(),
            });
        };
        let extraction = report::extract_report(path).await?;
        info!(
            critical = extraction.findings.len(),
            scanned = extraction.stats.vulnerabilities,
            skipped = extraction.stats.skipped_invalid,
            "findings extracted"
        );
        ctx.findings = extraction.findings;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Extract"
    }
}
