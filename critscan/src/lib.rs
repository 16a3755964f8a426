//! Queue-driven repository scanning.
//!
//! A job stages a shallow clone of an allow-listed repository inside a
//! [`Sandbox`], runs an external scanner against it, streams the report
//! keeping only critical findings, and persists the result through a
//! [`JobStore`]. Staged artifacts are removed on every exit path.

pub mod acquire;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod report;
pub mod repo_ref;
pub mod sandbox;
pub mod scanner;
pub mod stages;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{PipelineError, SandboxError, StoreError};
pub use job::{Finding, JobId, ScanJob, ScanStatus, Severity};
pub use orchestrator::{JobOutcome, ScanJobProcessor};
pub use queue::{JobMessage, JobQueue};
pub use sandbox::Sandbox;
pub use store::{JobStore, MemoryStore, SqliteStore};
pub use worker::{Worker, WorkerSummary};
