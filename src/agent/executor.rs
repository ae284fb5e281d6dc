use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CadenceError, Result};
use crate::scheduler::{ExecutionStatus, JobAction};

pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// How long output readers may keep going after the process is gone.
/// Background children that inherited the pipes would otherwise hold us.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of running one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Byte buffer that keeps the first `limit` bytes and remembers whether
/// anything was dropped.
#[derive(Debug)]
pub struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn push_str(&mut self, text: &str) {
        self.push(text.as_bytes());
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        let mut output = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            output.push_str(TRUNCATION_MARKER);
        }
        output
    }
}

/// Runs job actions under a deadline and a cancellation token.
///
/// Shell actions run as child processes with stdout and stderr captured
/// into one bounded buffer. No sandboxing is applied; the process runs with
/// the agent's privileges.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    max_output_bytes: usize,
    http: reqwest::Client,
}

impl JobExecutor {
    pub fn new(max_output_bytes: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CadenceError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            max_output_bytes,
            http,
        })
    }

    pub async fn execute(
        &self,
        action: &JobAction,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        match action {
            JobAction::Shell { command, args } => {
                self.run_shell(command, args, deadline, cancel).await
            }
            JobAction::Http { url, method, body } => {
                self.run_http(url, method, body.as_deref(), deadline, cancel)
                    .await
            }
        }
    }

    async fn run_shell(
        &self,
        command: &str,
        args: &[String],
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let mut cmd = if args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let mut cmd = Command::new(command);
            cmd.args(args);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command, error = %e, "Failed to start command");
                return ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    output: format!("failed to start command: {}", e),
                };
            }
        };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output_bytes)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, buffer.clone())));
        }

        let (status, exit_code) = tokio::select! {
            waited = child.wait() => match waited {
                Ok(exit) if exit.success() => (ExecutionStatus::Succeeded, exit.code()),
                Ok(exit) => (ExecutionStatus::Failed, exit.code()),
                Err(e) => {
                    buffer.lock().await.push_str(&format!("\nfailed to wait for command: {}\n", e));
                    (ExecutionStatus::Failed, None)
                }
            },
            _ = sleep_for(deadline) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(command, error = %e, "Failed to kill timed out command");
                }
                (ExecutionStatus::TimedOut, None)
            }
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(command, error = %e, "Failed to kill cancelled command");
                }
                (ExecutionStatus::Cancelled, None)
            }
        };

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                abort.abort();
            }
        }

        let output = {
            let mut guard = buffer.lock().await;
            std::mem::replace(&mut *guard, OutputBuffer::new(0)).into_string()
        };

        tracing::debug!(command, status = %status, exit_code = ?exit_code, "Command finished");
        ExecutionOutcome {
            status,
            exit_code,
            output,
        }
    }

    async fn run_http(
        &self,
        url: &str,
        method: &str,
        body: Option<&str>,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                return ExecutionOutcome {
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    output: format!("invalid method {}: {}", method, e),
                }
            }
        };

        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let mut buffer = OutputBuffer::new(self.max_output_bytes);
        let status = tokio::select! {
            status = read_response(request, &mut buffer) => status,
            _ = sleep_for(deadline) => ExecutionStatus::TimedOut,
            _ = cancel.cancelled() => ExecutionStatus::Cancelled,
        };

        tracing::debug!(url, status = %status, "HTTP action finished");
        ExecutionOutcome {
            status,
            exit_code: None,
            output: buffer.into_string(),
        }
    }
}

/// Send the request and stream the body into `buffer`. Reading stops once
/// the buffer is full; the rest of the body is never held in memory.
async fn read_response(
    request: reqwest::RequestBuilder,
    buffer: &mut OutputBuffer,
) -> ExecutionStatus {
    let mut response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            buffer.push_str(&format!("request failed: {}", e));
            return ExecutionStatus::Failed;
        }
    };
    let status = response.status();
    buffer.push_str(&format!("HTTP {}\n", status));

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                buffer.push(&chunk);
                if buffer.is_truncated() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                buffer.push_str(&format!("\nfailed to read body: {}", e));
                return ExecutionStatus::Failed;
            }
        }
    }

    if status.is_success() {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::Failed
    }
}

async fn pump<R>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.lock().await.push(&chunk[..n]),
        }
    }
}

async fn sleep_for(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending().await,
    }
}
