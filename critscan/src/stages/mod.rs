pub mod acquire;
pub mod extract;
pub mod persist;
pub mod scan;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::PipelineError;

#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError>;
    fn name(&self) -> &'static str;
}

pub use acquire::AcquireStage;
pub use extract::ExtractStage;
pub use persist::PersistStage;
pub use scan::ScanStage;
