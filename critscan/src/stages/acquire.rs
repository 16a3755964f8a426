use async_trait::async_trait;
use tracing::{debug, instrument};

use super::Stage;
use crate::acquire::GitAcquirer;
use crate::context::JobContext;
use crate::error::PipelineError;

pub struct AcquireStage {
    acquirer: GitAcquirer,
}

impl AcquireStage {
    pub fn new(acquirer: GitAcquirer) -> Self {
        Self { acquirer }
    }
}

#[async_trait]
impl Stage for AcquireStage {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id))]
    async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        // Validate before registering anything: a rejected reference must
        // not cause any filesystem activity, cleanup included.
        self.acquirer.policy().validate(&ctx.repository)?;
        ctx.artifacts
            .track_dir(GitAcquirer::staging_dir(&ctx.sandbox, &ctx.job_id));

        let staged = self
            .acquirer
            .acquire(&ctx.sandbox, &ctx.job_id, &ctx.repository)
            .await?;
        debug!(path = %staged.path.display(), "repository staged");
        ctx.staged = Some(staged);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Acquire"
    }
}
