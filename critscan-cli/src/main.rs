mod cli;

use std::collections::HashSet;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use critscan::output::{self, OutputFormatter, WorkReport};
use critscan::{
    Config, JobId, JobMessage, JobQueue, JobStore, Sandbox, ScanJobProcessor, ScanStatus,
    SqliteStore, Worker,
};

use cli::{Cli, Command, LogFormat, OutputFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(&args);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(args: &Cli) {
    let filter = EnvFilter::builder()
        .with_default_directive(args.verbose.tracing_level_filter().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(args: &Cli) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = &args.database_url {
        config.database_url = url.clone();
    }
    if let Some(root) = &args.sandbox_root {
        config.sandbox_root = root.clone();
    }
    Ok(config)
}

async fn run(args: Cli) -> Result<ExitCode> {
    let mut config = load_config(&args)?;
    let formatter = output::formatter(args.format == OutputFormat::Json);
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("failed to open job store")?,
    );

    match args.command {
        Command::Submit { repository } => {
            let job_id = store.create_job(&repository).await?;
            info!(job_id = %job_id, repository = %repository, "job queued");
            formatter.write_submitted(&job_id, &mut std::io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { job_id } => {
            let job_id: JobId = job_id.parse()?;
            let Some(job) = store.get_job(&job_id).await? else {
                bail!("job {job_id} not found");
            };
            formatter.write_jobs(&[job], &mut std::io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Scan { repository } => {
            let processor = processor(&config, store).await?;
            // Stage failures come back on the record; anything else is an error.
            let job = processor
                .scan_now(&repository)
                .await
                .with_context(|| format!("scan of {repository} did not complete"))?;
            formatter.write_jobs(std::slice::from_ref(&job), &mut std::io::stdout().lock())?;
            Ok(if job.status == ScanStatus::Finished {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Work {
            concurrency,
            follow,
        } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            work(&config, store, formatter.as_ref(), follow).await
        }
    }
}

async fn processor(config: &Config, store: Arc<dyn JobStore>) -> Result<ScanJobProcessor> {
    let sandbox = Sandbox::open(&config.sandbox_root)
        .await
        .with_context(|| format!("failed to open sandbox {}", config.sandbox_root.display()))?;
    Ok(ScanJobProcessor::from_config(config, store, sandbox))
}

/// Publish queued jobs not yet handed to the queue. Returns how many were published.
///
/// `seen` only keeps ids that are still queued; a job never returns to
/// Queued once picked up.
async fn feed(store: &dyn JobStore, queue: &JobQueue, seen: &mut HashSet<JobId>) -> Result<usize> {
    let queued = store.list_jobs(Some(ScanStatus::Queued)).await?;
    seen.retain(|id| queued.iter().any(|job| job.id == *id));

    let mut published = 0;
    for job in queued {
        if seen.insert(job.id.clone()) {
            queue
                .publish(JobMessage {
                    job_id: job.id,
                    repository: job.repository,
                })
                .await;
            published += 1;
        }
    }
    Ok(published)
}

async fn work(
    config: &Config,
    store: Arc<dyn JobStore>,
    formatter: &dyn OutputFormatter,
    follow: bool,
) -> Result<ExitCode> {
    let processor = Arc::new(processor(config, store.clone()).await?);
    let queue = Arc::new(JobQueue::new(config.worker.max_attempts));
    let worker = Worker::new(queue.clone(), processor, config.worker.concurrency);

    let mut seen = HashSet::new();
    let published = feed(store.as_ref(), &queue, &mut seen).await?;
    info!(published, concurrency = worker.concurrency(), "starting worker");

    let summary = if follow {
        let feeder = {
            let (store, queue) = (store.clone(), queue.clone());
            let interval = config.worker.poll_interval();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = feed(store.as_ref(), &queue, &mut seen).await {
                        warn!(error = %format!("{e:#}"), "failed to poll for queued jobs");
                    }
                }
            })
        };
        let summary = worker
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for interrupt");
                }
            })
            .await;
        feeder.abort();
        summary
    } else {
        worker.run_until_idle().await
    };

    let dead_letters = queue.dead_letters().await;
    let mut stdout = std::io::stdout().lock();
    formatter.write_work_report(
        &WorkReport {
            summary: &summary,
            dead_letters: &dead_letters,
        },
        &mut stdout,
    )?;
    stdout.flush()?;

    Ok(if summary.dead_lettered == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use critscan::MemoryStore;

    #[tokio::test]
    async fn feed_publishes_each_queued_job_once_and_forgets_picked_up_ones() {
        let store = MemoryStore::new();
        let queue = JobQueue::default();
        let mut seen = HashSet::new();
        let a = store.create_job("https://github.com/o/a").await.unwrap();
        let b = store.create_job("https://github.com/o/b").await.unwrap();

        assert_eq!(feed(&store, &queue, &mut seen).await.unwrap(), 2);
        assert_eq!(feed(&store, &queue, &mut seen).await.unwrap(), 0);
        assert_eq!(queue.len().await, 2);

        store.set_status(&a, ScanStatus::Scanning).await.unwrap();
        assert_eq!(feed(&store, &queue, &mut seen).await.unwrap(), 0);
        assert_eq!(seen.len(), 1);
        assert!(seen.contains(&b));

        let c = store.create_job("https://github.com/o/c").await.unwrap();
        assert_eq!(feed(&store, &queue, &mut seen).await.unwrap(), 1);
        assert!(seen.contains(&c));
    }
}
