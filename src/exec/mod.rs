pub mod enhancer;
pub mod retry;
pub mod truncate;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Default per-attempt timeout for foreground commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on captured bytes per stream. Processes that exceed it are killed.
pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// A request for the raw executor. The command string is passed to the shell
/// opaquely; the core never parses quoting.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Outcome of one raw execution attempt. Failures travel inside this struct
/// (exit code, stderr, flags), never as `Err`: every caller of the dedup
/// layer must observe the same clonable value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandResult {
    /// Synthetic failure for infrastructure problems (spawn error, lost
    /// execution task). Exit code −1 distinguishes it from shell exits.
    pub fn internal_failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            success: false,
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// The raw execution seam. Production uses [`ShellExecutor`]; tests inject
/// fakes with scripted outputs.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, req: &ExecRequest) -> CommandResult;
}

/// Drop guard that kills the entire process group (not just the leader PID).
/// Grandchildren spawned by the shell survive a plain child kill; signalling
/// the negative PID reaches the whole group.
struct ProcessGroupGuard {
    pid: Option<u32>,
    disarmed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            disarmed: false,
        }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
}

/// Executes commands through `sh -c` with piped stdio, its own process
/// group, a per-attempt timeout, and byte-capped output reads.
pub struct ShellExecutor;

#[allow(clippy::new_without_default)]
impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, req: &ExecRequest) -> CommandResult {
        let start = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&req.command)
            .current_dir(&req.cwd)
            .envs(&req.env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0); // child becomes its own group leader

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandResult::internal_failure(format!("failed to spawn shell: {e}"));
            }
        };

        let child_pid = child.id();
        let mut pg_guard = ProcessGroupGuard::new(child_pid);

        let stdout_pipe = child.stdout.take().expect("stdout was piped");
        let stderr_pipe = child.stderr.take().expect("stderr was piped");

        // Read one extra byte beyond the cap so "exactly at the limit" and
        // "exceeded the limit" are distinguishable.
        let read_limit = MAX_OUTPUT_BYTES as u64 + 1;

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(64 * 1024);
            let mut capped = stdout_pipe.take(read_limit);
            if let Err(e) = capped.read_to_end(&mut buf).await {
                tracing::warn!("stdout pipe read error: {e}");
            }
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(64 * 1024);
            let mut capped = stderr_pipe.take(read_limit);
            if let Err(e) = capped.read_to_end(&mut buf).await {
                tracing::warn!("stderr pipe read error: {e}");
            }
            buf
        });

        let read_future = async {
            let stdout = stdout_handle.await.unwrap_or_default();
            let stderr = stderr_handle.await.unwrap_or_default();
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let (stdout_raw, stderr_raw, status) =
            match tokio::time::timeout(req.timeout, read_future).await {
                Ok(data) => data,
                Err(_) => {
                    // Timeout: kill the whole group, not just the leader.
                    if let Some(pid) = child_pid {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                    pg_guard.disarm();
                    return CommandResult {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: -1,
                        success: false,
                        timed_out: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                }
            };
        pg_guard.disarm();

        let truncate_cap = |mut buf: Vec<u8>| {
            buf.truncate(MAX_OUTPUT_BYTES);
            buf
        };
        let stdout = String::from_utf8_lossy(&truncate_cap(stdout_raw)).to_string();
        let stderr = String::from_utf8_lossy(&truncate_cap(stderr_raw)).to_string();

        let exit_code = match status {
            Ok(s) => s.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!("wait failed: {e}");
                -1
            }
        };

        CommandResult {
            stdout,
            stderr,
            exit_code,
            success: exit_code == 0,
            timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}
