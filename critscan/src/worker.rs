use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::orchestrator::{JobOutcome, ScanJobProcessor};
use crate::queue::{Delivery, JobQueue, NackOutcome};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    Completed,
    Skipped,
    Requeued,
    DeadLettered,
}

impl WorkerSummary {
    fn record(&mut self, handled: Handled) {
        match handled {
            Handled::Completed => self.completed += 1,
            Handled::Skipped => self.skipped += 1,
            Handled::Requeued => self.failed += 1,
            Handled::DeadLettered => {
                self.failed += 1;
                self.dead_lettered += 1;
            }
        }
    }
}

/// Pulls deliveries off a [`JobQueue`] and runs each through the processor,
/// at most `concurrency` at a time.
pub struct Worker {
    queue: Arc<JobQueue>,
    processor: Arc<ScanJobProcessor>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl Worker {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<ScanJobProcessor>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            queue,
            processor,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process until the queue is empty and nothing is in flight.
    ///
    /// Requeued deliveries are picked up again in the same run.
    #[instrument(skip(self), fields(concurrency = self.concurrency))]
    pub async fn run_until_idle(&self) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        let mut tasks = JoinSet::new();

        loop {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            match self.queue.try_receive().await {
                Some(delivery) => {
                    let (queue, processor) = (self.queue.clone(), self.processor.clone());
                    tasks.spawn(async move {
                        let _permit = permit;
                        handle(&queue, &processor, delivery).await
                    });
                }
                None => {
                    drop(permit);
                    match tasks.join_next().await {
                        Some(joined) => summary.record(unwrap_join(joined)),
                        None => break,
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            summary.record(unwrap_join(joined));
        }
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            dead_lettered = summary.dead_lettered,
            "queue drained"
        );
        summary
    }

    /// Process deliveries as they arrive until `shutdown` resolves or the
    /// queue is closed, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, finishing in-flight jobs");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    drop(permit);
                    summary.record(unwrap_join(joined));
                }
                delivery = self.queue.receive() => {
                    let Some(delivery) = delivery else { break };
                    let (queue, processor) = (self.queue.clone(), self.processor.clone());
                    tasks.spawn(async move {
                        let _permit = permit;
                        handle(&queue, &processor, delivery).await
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            summary.record(unwrap_join(joined));
        }
        summary
    }
}

async fn handle(queue: &JobQueue, processor: &ScanJobProcessor, delivery: Delivery) -> Handled {
    let message = &delivery.message;
    match processor
        .process_scan_job(&message.job_id, &message.repository)
        .await
    {
        Ok(outcome) => {
            queue.ack(delivery);
            match outcome {
                JobOutcome::Finished { .. } => Handled::Completed,
                JobOutcome::AlreadyTerminal { .. } => Handled::Skipped,
            }
        }
        Err(e) => match queue.nack(delivery, e.diagnostic()).await {
            NackOutcome::Requeued => Handled::Requeued,
            NackOutcome::DeadLettered => Handled::DeadLettered,
        },
    }
}

fn unwrap_join(joined: Result<Handled, tokio::task::JoinError>) -> Handled {
    joined.unwrap_or_else(|e| {
        // The artifact guard has already cleaned up; the delivery is lost.
        error!(error = %e, "job task panicked");
        Handled::DeadLettered
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::context::JobContext;
    use crate::error::PipelineError;
    use crate::pipeline::PipelineBuilder;
    use crate::queue::JobMessage;
    use crate::sandbox::Sandbox;
    use crate::stages::Stage;
    use crate::store::{JobStore, MemoryStore};

    /// Fails repositories whose name ends in `-bad`; tracks peak concurrency.
    struct Probe {
        running: AtomicUsize,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Probe {
        async fn run(&self, ctx: &mut JobContext) -> Result<(), PipelineError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if ctx.repository.ends_with("-bad") {
                return Err(PipelineError::AcquisitionFailed(anyhow::anyhow!("clone failed")));
            }
            Ok(())
        }
        fn name(&self) -> &'static str {
            "Probe"
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        queue: Arc<JobQueue>,
        worker: Worker,
        peak: Arc<AtomicUsize>,
    }

    async fn setup(concurrency: usize, max_attempts: u32) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::open(dir.path()).await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let peak = Arc::new(AtomicUsize::new(0));
        let pipeline = PipelineBuilder::new()
            .stage(Probe {
                running: AtomicUsize::new(0),
                peak: peak.clone(),
            })
            .build();
        let processor = Arc::new(ScanJobProcessor::new(store.clone(), sandbox, pipeline));
        let queue = Arc::new(JobQueue::new(max_attempts));
        let worker = Worker::new(queue.clone(), processor, concurrency);
        Setup {
            _dir: dir,
            store,
            queue,
            worker,
            peak,
        }
    }

    async fn submit(setup: &Setup, repository: &str) -> crate::job::JobId {
        let job_id = setup.store.create_job(repository).await.unwrap();
        setup
            .queue
            .publish(JobMessage {
                job_id: job_id.clone(),
                repository: repository.to_string(),
            })
            .await;
        job_id
    }

    #[tokio::test]
    async fn drains_queue_with_bounded_concurrency() {
        let setup = setup(2, 1).await;
        for i in 0..6 {
            submit(&setup, &format!("https://github.com/o/r{i}")).await;
        }

        let summary = setup.worker.run_until_idle().await;
        assert_eq!(summary.completed, 6);
        assert_eq!(summary.failed, 0);
        assert!(setup.peak.load(Ordering::SeqCst) <= 2);
        assert!(setup.queue.is_empty().await);
    }

    #[tokio::test]
    async fn failures_are_dead_lettered() {
        let setup = setup(2, 1).await;
        submit(&setup, "https://github.com/o/good").await;
        let bad = submit(&setup, "https://github.com/o/repo-bad").await;

        let summary = setup.worker.run_until_idle().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.dead_lettered, 1);

        let dead = setup.queue.dead_letters().await;
        assert_eq!(dead[0].message.job_id, bad);
        assert!(dead[0].error.starts_with("AcquisitionFailed"));
    }

    #[tokio::test]
    async fn redelivery_of_failed_job_is_a_no_op() {
        let setup = setup(1, 2).await;
        submit(&setup, "https://github.com/o/repo-bad").await;

        let summary = setup.worker.run_until_idle().await;
        // Second delivery finds the job already Failed and acks it.
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.dead_lettered, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let setup = setup(2, 1).await;
        submit(&setup, "https://github.com/o/one").await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stop = async move {
            let _ = rx.await;
        };
        let queue = setup.queue.clone();
        let trigger = tokio::spawn(async move {
            while !queue.is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(());
        });

        let summary = setup.worker.run(stop).await;
        trigger.await.unwrap();
        assert_eq!(summary.completed, 1);
    }
}
