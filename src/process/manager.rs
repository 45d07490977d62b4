use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::ShellError;
use crate::events::{EventBus, ProcessEvent, ShellEvent};
use crate::process::buffer::{OutputBuffer, OutputLine, StreamKind, DEFAULT_CAPACITY};
use crate::process::resources::{ResourceSample, ResourceSampler};

/// Per-session background process limit.
pub const MAX_PER_SESSION: usize = 50;

/// Global background process limit.
pub const MAX_TOTAL: usize = 200;

/// Output lines written to the process record on disk.
const PERSISTED_OUTPUT_LINES: usize = 1000;

/// Delay between kill and record removal, so final output can be read.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Interval of the batched resource-sampling task.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
    Killed,
    /// Reloaded from persistence with its OS pid still alive, but the live
    /// pipes are lost.
    Orphaned,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Killed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ProcessSignal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl ProcessSignal {
    fn as_libc(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Latest resource sample plus how many samples this process has received.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResources {
    #[serde(flatten)]
    pub latest: ResourceSample,
    pub sample_count: u64,
}

#[derive(Debug, Clone)]
struct ProcessMeta {
    id: String,
    session_id: String,
    command: String,
    args: Vec<String>,
    pid: Option<u32>,
    status: ProcessStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    cwd: String,
    env: HashMap<String, String>,
    resources: Option<ProcessResources>,
}

/// Point-in-time snapshot for listings and tool responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ProcessResources>,
}

struct ProcessRecord {
    meta: Mutex<ProcessMeta>,
    buffer: Arc<OutputBuffer>,
}

impl ProcessRecord {
    fn info(&self) -> ProcessInfo {
        let meta = self.meta.lock().expect("process meta poisoned");
        ProcessInfo {
            id: meta.id.clone(),
            session_id: meta.session_id.clone(),
            command: meta.command.clone(),
            args: meta.args.clone(),
            pid: meta.pid,
            status: meta.status,
            start_time: meta.start_time,
            end_time: meta.end_time,
            exit_code: meta.exit_code,
            cwd: meta.cwd.clone(),
            resources: meta.resources,
        }
    }
}

/// On-disk shape of a process record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedProcess {
    id: String,
    session_id: String,
    command: String,
    args: Vec<String>,
    #[serde(default)]
    pid: Option<u32>,
    status: ProcessStatus,
    start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    metadata: PersistedMetadata,
    #[serde(default)]
    output_history: Vec<OutputLine>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedMetadata {
    cwd: String,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Spawns, tracks, samples, kills, and persists background processes.
/// The record map is shared with detached grace-removal tasks.
pub struct ProcessManager {
    dir: PathBuf,
    processes: Arc<Mutex<HashMap<String, Arc<ProcessRecord>>>>,
    sampler: Arc<ResourceSampler>,
    events: EventBus,
}

impl ProcessManager {
    pub fn new(dir: PathBuf, sampler: Arc<ResourceSampler>, events: EventBus) -> Self {
        Self {
            dir,
            processes: Arc::new(Mutex::new(HashMap::new())),
            sampler,
            events,
        }
    }

    /// Spawn a background process under a session's cwd and env. Fails with
    /// a distinguishable error when a limit is hit.
    pub async fn spawn(
        &self,
        session_id: &str,
        command: &str,
        args: &[String],
        cwd: &str,
        env: &HashMap<String, String>,
    ) -> Result<String, ShellError> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut processes = self.processes.lock().expect("process map poisoned");
            let session_count = processes
                .values()
                .filter(|r| {
                    let meta = r.meta.lock().expect("process meta poisoned");
                    meta.session_id == session_id && !meta.status.is_terminal()
                })
                .count();
            if session_count >= MAX_PER_SESSION {
                return Err(ShellError::SessionProcessLimit {
                    session: session_id.to_string(),
                    count: session_count,
                    max: MAX_PER_SESSION,
                });
            }
            if processes.len() >= MAX_TOTAL {
                return Err(ShellError::TotalProcessLimit {
                    count: processes.len(),
                    max: MAX_TOTAL,
                });
            }

            let record = Arc::new(ProcessRecord {
                meta: Mutex::new(ProcessMeta {
                    id: id.clone(),
                    session_id: session_id.to_string(),
                    command: command.to_string(),
                    args: args.to_vec(),
                    pid: None,
                    status: ProcessStatus::Starting,
                    start_time: Utc::now(),
                    end_time: None,
                    exit_code: None,
                    cwd: cwd.to_string(),
                    env: env.clone(),
                    resources: None,
                }),
                buffer: Arc::new(OutputBuffer::new(DEFAULT_CAPACITY)),
            });
            processes.insert(id.clone(), record);
        }

        let record = self.get_record(&id).expect("record just inserted");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                {
                    let mut meta = record.meta.lock().expect("process meta poisoned");
                    meta.status = ProcessStatus::Failed;
                    meta.end_time = Some(Utc::now());
                }
                self.persist_record(&record);
                return Err(ShellError::Spawn(format!("{command}: {e}")));
            }
        };

        {
            let mut meta = record.meta.lock().expect("process meta poisoned");
            meta.pid = child.id();
            meta.status = ProcessStatus::Running;
        }
        self.events.emit(ShellEvent::Process(ProcessEvent::Started {
            id: id.clone(),
            session: session_id.to_string(),
        }));
        self.persist_record(&record);

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Reader tasks line-split each stream into the shared ring buffer.
        // `lines()` flushes a partial final line at EOF as its own line.
        let out_buf = record.buffer.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_buf.add(StreamKind::Stdout, line);
            }
        });
        let err_buf = record.buffer.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_buf.add(StreamKind::Stderr, line);
            }
        });

        // Exit watcher: drain output first so the persisted record carries
        // everything the process wrote.
        let watcher_record = record.clone();
        let events = self.events.clone();
        let dir = self.dir.clone();
        let watch_id = id.clone();
        tokio::spawn(async move {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(id = %watch_id, "wait failed: {e}");
                    None
                }
            };

            {
                let mut meta = watcher_record.meta.lock().expect("process meta poisoned");
                meta.end_time = Some(Utc::now());
                meta.exit_code = exit_code;
                // A kill marks the record first; don't overwrite it.
                if meta.status != ProcessStatus::Killed {
                    meta.status = if exit_code == Some(0) {
                        ProcessStatus::Stopped
                    } else {
                        ProcessStatus::Failed
                    };
                }
            }
            events.emit(ShellEvent::Process(ProcessEvent::Exited {
                id: watch_id.clone(),
                exit_code,
            }));
            persist_to_dir(&dir, &watcher_record).await;
        });

        Ok(id)
    }

    /// Send a signal to the process group, mark the record KILLED, and
    /// remove it after a grace period so final output can be collected.
    pub fn kill(&self, id: &str, signal: ProcessSignal) -> Result<ProcessInfo, ShellError> {
        let record = self
            .get_record(id)
            .ok_or_else(|| ShellError::ProcessNotFound(id.to_string()))?;

        {
            let mut meta = record.meta.lock().expect("process meta poisoned");
            if let Some(pid) = meta.pid {
                unsafe {
                    libc::kill(-(pid as i32), signal.as_libc());
                }
            }
            meta.status = ProcessStatus::Killed;
            meta.end_time = Some(Utc::now());
        }
        self.events.emit(ShellEvent::Process(ProcessEvent::Killed {
            id: id.to_string(),
        }));

        let info = record.info();
        self.schedule_removal(id.to_string());
        Ok(info)
    }

    fn schedule_removal(&self, id: String) {
        let dir = self.dir.clone();
        let processes = self.processes.clone();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            if let Ok(mut map) = processes.lock() {
                map.remove(&id);
            }
            let path = dir.join(format!("{id}.json"));
            let _ = tokio::fs::remove_file(&path).await;
        });
    }

    pub fn get_info(&self, id: &str) -> Option<ProcessInfo> {
        self.get_record(id).map(|r| r.info())
    }

    pub fn get_buffer(&self, id: &str) -> Option<Arc<OutputBuffer>> {
        self.get_record(id).map(|r| r.buffer.clone())
    }

    pub fn list(&self, session_id: Option<&str>) -> Vec<ProcessInfo> {
        let processes = self.processes.lock().expect("process map poisoned");
        let mut infos: Vec<ProcessInfo> = processes
            .values()
            .map(|r| r.info())
            .filter(|info| session_id.is_none_or(|s| info.session_id == s))
            .collect();
        infos.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        infos
    }

    /// Kill every process belonging to a session (used by session deletion).
    pub fn kill_session_processes(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .list(Some(session_id))
            .into_iter()
            .filter(|info| !info.status.is_terminal())
            .map(|info| info.id)
            .collect();
        let mut killed = 0;
        for id in ids {
            if self.kill(&id, ProcessSignal::Term).is_ok() {
                killed += 1;
            }
        }
        killed
    }

    /// Record a resource sample for a process.
    pub fn update_resources(&self, id: &str, sample: ResourceSample) {
        if let Some(record) = self.get_record(id) {
            let mut meta = record.meta.lock().expect("process meta poisoned");
            let sample_count = meta.resources.map(|r| r.sample_count).unwrap_or(0) + 1;
            meta.resources = Some(ProcessResources {
                latest: sample,
                sample_count,
            });
        }
    }

    /// Periodic task: sample all RUNNING processes in one batch.
    pub fn spawn_resource_monitor(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                let running: Vec<(String, u32)> = manager
                    .list(None)
                    .into_iter()
                    .filter(|info| info.status == ProcessStatus::Running)
                    .filter_map(|info| info.pid.map(|pid| (info.id, pid)))
                    .collect();
                if running.is_empty() {
                    continue;
                }
                let pids: Vec<u32> = running.iter().map(|(_, pid)| *pid).collect();
                let samples = manager.sampler.sample_processes(&pids).await;
                for (id, pid) in running {
                    if let Some(sample) = samples.get(&pid) {
                        manager.update_resources(&id, *sample);
                    }
                }
            }
        });
    }

    /// Reconstruct records from disk. Metadata and output history are
    /// re-attached; live pipes are not. A recorded RUNNING process whose pid
    /// is still alive becomes ORPHANED; a dead one becomes FAILED.
    pub async fn load(&self) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("cannot read process dir: {e}");
                return 0;
            }
        };

        let mut loaded = 0;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "unreadable process file: {e}");
                    continue;
                }
            };
            let persisted: PersistedProcess = match serde_json::from_str(&content) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "corrupt process file: {e}");
                    continue;
                }
            };

            let status = if persisted.status.is_terminal() {
                persisted.status
            } else if persisted.pid.is_some_and(pid_alive) {
                ProcessStatus::Orphaned
            } else {
                ProcessStatus::Failed
            };
            let end_time = match status {
                ProcessStatus::Failed if persisted.end_time.is_none() => Some(Utc::now()),
                _ => persisted.end_time,
            };

            let buffer = Arc::new(OutputBuffer::new(DEFAULT_CAPACITY));
            for line in persisted.output_history {
                buffer.restore(line);
            }

            let record = Arc::new(ProcessRecord {
                meta: Mutex::new(ProcessMeta {
                    id: persisted.id.clone(),
                    session_id: persisted.session_id,
                    command: persisted.command,
                    args: persisted.args,
                    pid: persisted.pid,
                    status,
                    start_time: persisted.start_time,
                    end_time,
                    exit_code: persisted.exit_code,
                    cwd: persisted.metadata.cwd,
                    env: persisted.metadata.env,
                    resources: None,
                }),
                buffer,
            });
            self.processes
                .lock()
                .expect("process map poisoned")
                .insert(persisted.id, record);
            loaded += 1;
        }

        tracing::info!(count = loaded, "background processes loaded");
        loaded
    }

    fn get_record(&self, id: &str) -> Option<Arc<ProcessRecord>> {
        self.processes
            .lock()
            .expect("process map poisoned")
            .get(id)
            .cloned()
    }

    fn persist_record(&self, record: &Arc<ProcessRecord>) {
        let dir = self.dir.clone();
        let record = record.clone();
        tokio::spawn(async move {
            persist_to_dir(&dir, &record).await;
        });
    }
}

async fn persist_to_dir(dir: &std::path::Path, record: &Arc<ProcessRecord>) {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!("cannot create process dir: {e}");
        return;
    }

    let (persisted, id) = {
        let meta = record.meta.lock().expect("process meta poisoned");
        (
            PersistedProcess {
                id: meta.id.clone(),
                session_id: meta.session_id.clone(),
                command: meta.command.clone(),
                args: meta.args.clone(),
                pid: meta.pid,
                status: meta.status,
                start_time: meta.start_time,
                end_time: meta.end_time,
                exit_code: meta.exit_code,
                metadata: PersistedMetadata {
                    cwd: meta.cwd.clone(),
                    env: meta.env.clone(),
                },
                output_history: record
                    .buffer
                    .get_lines(Some(PERSISTED_OUTPUT_LINES), None),
            },
            meta.id.clone(),
        )
    };

    let json = match serde_json::to_string_pretty(&persisted) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!("cannot serialize process record: {e}");
            return;
        }
    };

    let path = dir.join(format!("{id}.json"));
    // Temp filename includes PID to avoid cross-process collisions.
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    if let Err(e) = tokio::fs::write(&tmp_path, json.as_bytes()).await {
        tracing::warn!("process persist failed: {e}");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        tracing::warn!("process persist rename failed: {e}");
    }
}

/// True when the pid exists (signal 0 delivery check).
fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
