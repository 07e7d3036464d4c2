use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::errors::{Result, ToolbridgeError};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 512 * 1024;

/// Environment variable carrying the absolute output directory into the
/// worker, so file discovery never depends on the worker's working directory.
pub const OUTPUT_DIR_ENV: &str = "AGENT_OUTPUT_DIR";

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    worker_command: String,
    worker_args: Vec<String>,
    output_dir: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl SupervisorConfig {
    pub fn new(
        worker_command: impl Into<String>,
        worker_args: Vec<String>,
        output_dir: impl AsRef<Path>,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Result<Self> {
        let worker_command = worker_command.into();
        if worker_command.trim().is_empty() {
            return Err(ToolbridgeError::InvalidConfig(
                "worker command must not be empty".to_string(),
            ));
        }
        let output_dir = output_dir.as_ref();
        if output_dir.is_relative() {
            return Err(ToolbridgeError::InvalidConfig(
                "output directory must be an absolute path".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(ToolbridgeError::InvalidConfig(
                "task timeout must be greater than zero".to_string(),
            ));
        }
        if max_output_bytes == 0 {
            return Err(ToolbridgeError::InvalidConfig(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            worker_command,
            worker_args,
            output_dir: output_dir.to_path_buf(),
            timeout,
            max_output_bytes,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GeneratedFile {
    pub name: String,
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub task: String,
    pub output: String,
    pub truncated: bool,
    /// Diagnostic only. The exit code decides the outcome.
    pub had_output: bool,
    pub outcome: TaskOutcome,
    pub exit_code: Option<i32>,
    pub files: Vec<GeneratedFile>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Launches one worker process per task, feeds the task text over stdin,
/// captures interleaved stdout/stderr into a bounded buffer, enforces a
/// wall-clock deadline with a forced kill, and scans the output directory
/// only after the worker has fully exited.
pub struct TaskSupervisor {
    config: SupervisorConfig,
}

impl TaskSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[instrument(skip(self, task), fields(task_len = task.len()))]
    pub async fn run_task(&self, task: &str) -> Result<TaskRun> {
        if task.trim().is_empty() {
            return Err(ToolbridgeError::MissingRequiredField("task"));
        }
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut command = Command::new(&self.config.worker_command);
        command
            .args(&self.config.worker_args)
            .env(OUTPUT_DIR_ENV, &self.config.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| ToolbridgeError::WorkerUnavailable(err.to_string()))?;

        // Fed concurrently so the deadline below also covers a task larger
        // than the pipe buffer handed to a worker that never reads stdin. A
        // broken pipe on the feed just means the worker went away first.
        let stdin_feed = child.stdin.take().map(|mut stdin| {
            let payload = format!("{task}\n");
            tokio::spawn(async move {
                let _ = stdin.write_all(payload.as_bytes()).await;
                // Dropping the handle closes the pipe so the worker sees EOF.
            })
        });

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.config.max_output_bytes)));
        let mut captures = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            captures.push(tokio::spawn(capture(stdout, Arc::clone(&buffer))));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(tokio::spawn(capture(stderr, Arc::clone(&buffer))));
        }

        let (outcome, exit_code) = match timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let outcome = if status.success() {
                    TaskOutcome::Success
                } else {
                    TaskOutcome::Failure
                };
                (outcome, status.code())
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                warn!(task_id = %id, timeout = ?self.config.timeout, "worker exceeded deadline, killing");
                if let Err(err) = child.start_kill() {
                    warn!(task_id = %id, error = %err, "failed to signal worker");
                }
                let _ = child.wait().await;
                (TaskOutcome::Timeout, None)
            }
        };

        // Once the worker is gone both pipe ends are closed, so the feed and
        // the captures finish promptly.
        if let Some(feed) = stdin_feed {
            let _ = feed.await;
        }
        for handle in captures {
            let _ = handle.await;
        }
        let (output, truncated) = buffer.lock().await.clone().finish();
        let had_output = !output.is_empty();

        // Scanned only after the worker is gone, so files are never read
        // while partially written. No snapshot diffing: pre-existing files
        // are reported too.
        let files = scan_output_dir(&self.config.output_dir).await?;
        let finished_at = Utc::now();

        info!(
            task_id = %id,
            outcome = ?outcome,
            exit_code = ?exit_code,
            files = files.len(),
            "task finished"
        );
        Ok(TaskRun {
            id,
            task: task.to_string(),
            output,
            truncated,
            had_output,
            outcome,
            exit_code,
            files,
            started_at,
            finished_at,
        })
    }
}

#[derive(Debug, Clone)]
struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.data.len());
        if chunk.len() > remaining {
            self.data.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    fn finish(self) -> (String, bool) {
        let mut output = String::from_utf8_lossy(&self.data).into_owned();
        if self.truncated {
            output.push_str(&format!("\n[output truncated at {} bytes]\n", self.limit));
        }
        (output, self.truncated)
    }
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => buffer.lock().await.push(&chunk[..read]),
        }
    }
}

async fn scan_output_dir(dir: &Path) -> Result<Vec<GeneratedFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push(GeneratedFile {
            path: format!("/api/files/{name}"),
            size: metadata.len(),
            name,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
