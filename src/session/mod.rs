use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ShellError;
use crate::process::manager::ProcessManager;

/// The default session id and name. Exists at startup, cannot be deleted.
pub const DEFAULT_SESSION: &str = "default";

/// In-memory history bound per session.
pub const HISTORY_CAP: usize = 1000;

/// History entries written to disk per session.
const PERSISTED_HISTORY: usize = 100;

/// Quiet period before a dirty session is flushed to disk.
const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// One executed command in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    name: String,
    cwd: String,
    env: HashMap<String, String>,
    history: VecDeque<HistoryEntry>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

/// Snapshot for listings and tool responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub cwd: String,
    pub created: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub history_len: usize,
    pub env_vars: usize,
}

/// On-disk shape: `~/.macos-shell/sessions/<id>.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    id: String,
    name: String,
    cwd: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    created: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

/// Named sessions owning cwd, env, and bounded command history. Disk writes
/// are debounced per session; `flush_pending_saves` forces completion.
/// The map is shared with detached debounce tasks, which snapshot dirty
/// sessions at write time.
pub struct SessionManager {
    dir: PathBuf,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    dirty: Arc<Mutex<HashSet<String>>>,
    generation: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            dirty: Arc::new(Mutex::new(HashSet::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load persisted sessions and make sure the default session exists.
    pub async fn initialize(&self) {
        let mut loaded = 0;
        if let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                match serde_json::from_str::<PersistedSession>(&content) {
                    Ok(p) => {
                        let session = Session {
                            id: p.id.clone(),
                            name: p.name,
                            cwd: p.cwd,
                            env: p.env,
                            history: p.history.into_iter().collect(),
                            created_at: p.created,
                            last_used_at: p.last_used,
                        };
                        self.sessions
                            .lock()
                            .expect("session map poisoned")
                            .insert(p.id, session);
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "corrupt session file: {e}");
                    }
                }
            }
        }

        {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            if !sessions.contains_key(DEFAULT_SESSION) {
                let home = dirs::home_dir()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| "/".to_string());
                sessions.insert(
                    DEFAULT_SESSION.to_string(),
                    Session {
                        id: DEFAULT_SESSION.to_string(),
                        name: DEFAULT_SESSION.to_string(),
                        cwd: home,
                        env: HashMap::new(),
                        history: VecDeque::new(),
                        created_at: Utc::now(),
                        last_used_at: Utc::now(),
                    },
                );
            }
        }
        self.mark_dirty(DEFAULT_SESSION);

        tracing::info!(count = loaded, "sessions loaded");
    }

    /// Create a named session. Names must be unique.
    pub fn create_session(
        &self,
        name: &str,
        cwd: Option<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<SessionInfo, ShellError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ShellError::Other("session name must not be empty".into()));
        }
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        if sessions.values().any(|s| s.name == name) {
            return Err(ShellError::Other(format!(
                "session name already in use: {name}"
            )));
        }
        let cwd = cwd.unwrap_or_else(|| {
            dirs::home_dir()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|| "/".to_string())
        });
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            cwd,
            env: env.unwrap_or_default(),
            history: VecDeque::new(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
        };
        let info = info_of(&session);
        let id = session.id.clone();
        sessions.insert(id.clone(), session);
        drop(sessions);
        self.mark_dirty(&id);
        Ok(info)
    }

    /// Resolve a session by id or name.
    pub fn resolve(&self, id_or_name: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(id_or_name)
            .or_else(|| sessions.values().find(|s| s.name == id_or_name))
            .map(info_of)
    }

    /// The session's working directory and environment, for executors.
    pub fn exec_context(&self, id_or_name: &str) -> Option<(String, HashMap<String, String>)> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(id_or_name)
            .or_else(|| sessions.values().find(|s| s.name == id_or_name))
            .map(|s| (s.cwd.clone(), s.env.clone()))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        let mut infos: Vec<SessionInfo> = sessions.values().map(info_of).collect();
        infos.sort_by(|a, b| a.created.cmp(&b.created));
        infos
    }

    /// Update a session's working directory (e.g. after a `cd`).
    pub fn update_cwd(&self, id_or_name: &str, cwd: &str) -> Result<(), ShellError> {
        let id = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let session = resolve_mut(&mut sessions, id_or_name)
                .ok_or_else(|| ShellError::SessionNotFound(id_or_name.to_string()))?;
            session.cwd = cwd.to_string();
            session.last_used_at = Utc::now();
            session.id.clone()
        };
        self.mark_dirty(&id);
        Ok(())
    }

    /// Set or remove an environment variable on a session.
    pub fn set_env_var(
        &self,
        id_or_name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<(), ShellError> {
        let id = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let session = resolve_mut(&mut sessions, id_or_name)
                .ok_or_else(|| ShellError::SessionNotFound(id_or_name.to_string()))?;
            match value {
                Some(v) => {
                    session.env.insert(key.to_string(), v);
                }
                None => {
                    session.env.remove(key);
                }
            }
            session.last_used_at = Utc::now();
            session.id.clone()
        };
        self.mark_dirty(&id);
        Ok(())
    }

    /// Append a history record and refresh `last_used_at`.
    pub fn add_to_history(&self, id_or_name: &str, entry: HistoryEntry) -> Result<(), ShellError> {
        let id = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let session = resolve_mut(&mut sessions, id_or_name)
                .ok_or_else(|| ShellError::SessionNotFound(id_or_name.to_string()))?;
            session.history.push_back(entry);
            while session.history.len() > HISTORY_CAP {
                session.history.pop_front();
            }
            session.last_used_at = Utc::now();
            session.id.clone()
        };
        self.mark_dirty(&id);
        Ok(())
    }

    pub fn history(&self, id_or_name: &str, limit: Option<usize>) -> Vec<HistoryEntry> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        let Some(session) = sessions
            .get(id_or_name)
            .or_else(|| sessions.values().find(|s| s.name == id_or_name))
        else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(session.history.len());
        session
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Delete a session: kill its background processes, drop it from the
    /// map, and remove its persisted file. The default session is refused.
    pub async fn delete_session(
        &self,
        id_or_name: &str,
        processes: &ProcessManager,
    ) -> Result<(), ShellError> {
        let id = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            let session = sessions
                .get(id_or_name)
                .or_else(|| sessions.values().find(|s| s.name == id_or_name))
                .ok_or_else(|| ShellError::SessionNotFound(id_or_name.to_string()))?;
            session.id.clone()
        };
        if id == DEFAULT_SESSION {
            return Err(ShellError::DefaultSessionUndeletable);
        }

        let killed = processes.kill_session_processes(&id);
        if killed > 0 {
            tracing::info!(session = %id, killed, "killed session processes on delete");
        }

        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(&id);
        self.dirty.lock().expect("dirty set poisoned").remove(&id);

        let path = self.dir.join(format!("{id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ShellError::Persistence(e)),
        }
    }

    /// Force all pending debounced saves to complete now.
    pub async fn flush_pending_saves(&self) {
        let ids: Vec<String> = {
            let mut dirty = self.dirty.lock().expect("dirty set poisoned");
            dirty.drain().collect()
        };
        for id in ids {
            self.save_session(&id).await;
        }
    }

    fn mark_dirty(&self, id: &str) {
        self.dirty
            .lock()
            .expect("dirty set poisoned")
            .insert(id.to_string());

        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Outside a runtime (sync unit tests) the caller flushes explicitly.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.generation.clone();
        let dirty = self.dirty.clone();
        let sessions = self.sessions.clone();
        let dir = self.dir.clone();
        handle.spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            if generation.load(Ordering::SeqCst) != my_gen {
                return; // a later mutation rescheduled the flush
            }
            let ids: Vec<String> = {
                let mut dirty = dirty.lock().expect("dirty set poisoned");
                dirty.drain().collect()
            };
            for id in ids {
                // Snapshot at write time so the newest state lands on disk.
                let persisted = {
                    let sessions = sessions.lock().expect("session map poisoned");
                    sessions.get(&id).map(persisted_of)
                };
                if let Some(p) = persisted {
                    write_session(&dir, &p).await;
                }
            }
        });
    }

    async fn save_session(&self, id: &str) {
        let persisted = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            sessions.get(id).map(persisted_of)
        };
        if let Some(p) = persisted {
            write_session(&self.dir, &p).await;
        }
    }
}

fn resolve_mut<'a>(
    sessions: &'a mut HashMap<String, Session>,
    id_or_name: &str,
) -> Option<&'a mut Session> {
    if sessions.contains_key(id_or_name) {
        return sessions.get_mut(id_or_name);
    }
    let id = sessions
        .values()
        .find(|s| s.name == id_or_name)
        .map(|s| s.id.clone())?;
    sessions.get_mut(&id)
}

fn info_of(session: &Session) -> SessionInfo {
    SessionInfo {
        id: session.id.clone(),
        name: session.name.clone(),
        cwd: session.cwd.clone(),
        created: session.created_at,
        last_used: session.last_used_at,
        history_len: session.history.len(),
        env_vars: session.env.len(),
    }
}

fn persisted_of(session: &Session) -> PersistedSession {
    let skip = session.history.len().saturating_sub(PERSISTED_HISTORY);
    PersistedSession {
        id: session.id.clone(),
        name: session.name.clone(),
        cwd: session.cwd.clone(),
        env: session.env.clone(),
        history: session.history.iter().skip(skip).cloned().collect(),
        created: session.created_at,
        last_used: session.last_used_at,
    }
}

async fn write_session(dir: &std::path::Path, persisted: &PersistedSession) {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!("cannot create session dir: {e}");
        return;
    }
    let json = match serde_json::to_string_pretty(persisted) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!("cannot serialize session: {e}");
            return;
        }
    };
    let path = dir.join(format!("{}.json", persisted.id));
    // Temp filename includes PID to avoid cross-process collisions.
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    if let Err(e) = tokio::fs::write(&tmp_path, json.as_bytes()).await {
        tracing::warn!("session persist failed: {e}");
        return;
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        tracing::warn!("session persist rename failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(PathBuf::from("/nonexistent/sessions"))
    }

    fn seeded(manager: &SessionManager) {
        manager.sessions.lock().unwrap().insert(
            DEFAULT_SESSION.to_string(),
            Session {
                id: DEFAULT_SESSION.to_string(),
                name: DEFAULT_SESSION.to_string(),
                cwd: "/".to_string(),
                env: HashMap::new(),
                history: VecDeque::new(),
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            },
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let m = manager();
        m.create_session("work", None, None).unwrap();
        assert!(m.create_session("work", None, None).is_err());
    }

    #[test]
    fn resolve_finds_by_name_and_id() {
        let m = manager();
        let info = m.create_session("work", Some("/tmp".into()), None).unwrap();
        assert!(m.resolve("work").is_some());
        assert!(m.resolve(&info.id).is_some());
        assert!(m.resolve("missing").is_none());
    }

    #[test]
    fn history_is_bounded() {
        let m = manager();
        seeded(&m);
        for i in 0..(HISTORY_CAP + 10) {
            m.add_to_history(
                DEFAULT_SESSION,
                HistoryEntry {
                    command: format!("echo {i}"),
                    args: vec![],
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    start_time: Utc::now(),
                    duration_ms: 1,
                },
            )
            .unwrap();
        }
        assert_eq!(m.history(DEFAULT_SESSION, None).len(), HISTORY_CAP);
        let recent = m.history(DEFAULT_SESSION, Some(2));
        assert_eq!(recent.len(), 2);
        assert!(recent[1].command.ends_with(&format!("{}", HISTORY_CAP + 9)));
    }

    #[test]
    fn persisted_history_is_capped_at_100() {
        let m = manager();
        seeded(&m);
        for i in 0..200 {
            m.add_to_history(
                DEFAULT_SESSION,
                HistoryEntry {
                    command: format!("echo {i}"),
                    args: vec![],
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                    start_time: Utc::now(),
                    duration_ms: 1,
                },
            )
            .unwrap();
        }
        let p = {
            let sessions = m.sessions.lock().unwrap();
            persisted_of(sessions.get(DEFAULT_SESSION).unwrap())
        };
        assert_eq!(p.history.len(), 100);
        assert_eq!(p.history.last().unwrap().command, "echo 199");
    }
}
