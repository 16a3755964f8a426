use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::context::JobContext;
use crate::error::PipelineError;
use crate::stages::Stage;

/// Ordered stages run against one job. The first failing stage ends the run.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<Vec<Box<dyn Stage>>>,
}

impl Pipeline {
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id, stage_count = self.stages.len()))]
    pub async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
        for stage in self.stages.iter() {
            if let Err(e) = stage.run(ctx).await {
                warn!(
                    stage = stage.name(),
                    job_id = %ctx.job_id,
                    kind = e.kind(),
                    error = %e,
                    "stage failed"
                );
                return Err(e);
            }
            debug!(stage = stage.name(), job_id = %ctx.job_id, "stage complete");
        }
        Ok(())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { stages: vec![] }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: Arc::new(self.stages),
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
