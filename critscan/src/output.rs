use std::io::{self, Write};

use serde::Serialize;

use crate::job::{JobId, ScanJob};
use crate::queue::DeadLetter;
use crate::worker::WorkerSummary;

#[derive(Serialize)]
pub struct WorkReport<'a> {
    #[serde(flatten)]
    pub summary: &'a WorkerSummary,
    pub dead_letters: &'a [DeadLetter],
}

pub trait OutputFormatter {
    fn write_jobs(&self, jobs: &[ScanJob], writer: &mut dyn Write) -> io::Result<()>;

    fn write_submitted(&self, job_id: &JobId, writer: &mut dyn Write) -> io::Result<()>;

    fn write_work_report(&self, report: &WorkReport<'_>, writer: &mut dyn Write) -> io::Result<()>;
}

pub struct TextOutput;

impl OutputFormatter for TextOutput {
    fn write_jobs(&self, jobs: &[ScanJob], writer: &mut dyn Write) -> io::Result<()> {
        for job in jobs {
            writeln!(writer, "{} {}", job.id, job.repository)?;
            writeln!(writer, "  status: {}", job.status)?;
            writeln!(
                writer,
                "  updated: {}",
                job.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            )?;
            if let Some(failure) = &job.failure {
                let mut lines = failure.lines();
                if let Some(first) = lines.next() {
                    writeln!(writer, "  failure: {first}")?;
                }
                for line in lines {
                    writeln!(writer, "    {line}")?;
                }
            }

            if job.findings.is_empty() {
                writeln!(writer, "  critical findings: none")?;
            } else {
                writeln!(writer, "  critical findings: {}", job.findings.len())?;
                for finding in &job.findings {
                    writeln!(writer, "    {finding}")?;
                }
            }
        }
        Ok(())
    }

    fn write_submitted(&self, job_id: &JobId, writer: &mut dyn Write) -> io::Result<()> {
        writeln!(writer, "{job_id}")
    }

    fn write_work_report(&self, report: &WorkReport<'_>, writer: &mut dyn Write) -> io::Result<()> {
        let s = report.summary;
        writeln!(
            writer,
            "completed: {}, skipped: {}, failed: {}, dead-lettered: {}",
            s.completed, s.skipped, s.failed, s.dead_lettered
        )?;
        for dead in report.dead_letters {
            let reason = dead.error.lines().next().unwrap_or_default();
            writeln!(
                writer,
                "  {} {} (attempts: {}): {reason}",
                dead.message.job_id, dead.message.repository, dead.attempts
            )?;
        }
        Ok(())
    }
}

pub struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn write_jobs(&self, jobs: &[ScanJob], writer: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, jobs)?;
        writeln!(writer)?;
        Ok(())
    }

    fn write_submitted(&self, job_id: &JobId, writer: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *writer, &serde_json::json!({ "job_id": job_id }))?;
        writeln!(writer)?;
        Ok(())
    }

    fn write_work_report(&self, report: &WorkReport<'_>, writer: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *writer, report)?;
        writeln!(writer)?;
        Ok(())
    }
}

pub fn formatter(json: bool) -> Box<dyn OutputFormatter> {
    if json {
        Box::new(JsonOutput)
    } else {
        Box::new(TextOutput)
    }
}
