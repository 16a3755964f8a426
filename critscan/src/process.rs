use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument};

const READ_CHUNK: usize = 8 * 1024;

/// Byte buffer that keeps only the most recent `limit` bytes written to it.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    limit: usize,
    dropped: u64,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(READ_CHUNK)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.limit == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }
        let chunk = if chunk.len() > self.limit {
            let skip = chunk.len() - self.limit;
            self.dropped += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes discarded to stay within the limit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn to_string_lossy(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(a.len() + b.len());
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        String::from_utf8_lossy(&joined).into_owned()
    }
}

/// Exit status plus the tails of both output streams.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: TailBuffer,
    pub stderr: TailBuffer,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    #[cfg(unix)]
    pub fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.signal()
    }

    #[cfg(not(unix))]
    pub fn signal(&self) -> Option<i32> {
        None
    }

    /// Human-readable tail of whatever the process printed.
    pub fn tail(&self) -> String {
        let mut sections = Vec::new();
        if !self.stdout.is_empty() {
            sections.push(format!("stdout (tail):\n{}", self.stdout.to_string_lossy()));
        }
        if !self.stderr.is_empty() {
            sections.push(format!("stderr (tail):\n{}", self.stderr.to_string_lossy()));
        }
        sections.join("\n")
    }
}

/// Spawn `command` with stdin closed and both outputs captured into tail
/// buffers of `limit` bytes, then wait for it to exit.
///
/// The child is killed if the returned future is dropped before completion,
/// which is how callers enforce wall-clock ceilings.
#[instrument(skip(command), fields(program = ?command.as_std().get_program()))]
pub async fn run_captured(mut command: Command, limit: usize) -> std::io::Result<CapturedOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (stdout, stderr, status) =
        tokio::join!(drain(stdout, limit), drain(stderr, limit), child.wait());
    let status = status?;
    let output = CapturedOutput {
        status,
        stdout: stdout?,
        stderr: stderr?,
    };
    debug!(
        code = ?output.exit_code(),
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        "process exited"
    );
    Ok(output)
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> std::io::Result<TailBuffer> {
    let mut tail = TailBuffer::new(limit);
    let Some(mut reader) = reader else {
        return Ok(tail);
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.push(&chunk[..n]);
    }
    Ok(tail)
}
