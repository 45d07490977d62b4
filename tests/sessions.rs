//! Tests for session lifecycle, history, and persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use sirocco::events::EventBus;
use sirocco::process::manager::ProcessManager;
use sirocco::process::resources::ResourceSampler;
use sirocco::session::{HistoryEntry, SessionManager, DEFAULT_SESSION};

fn entry(command: &str) -> HistoryEntry {
    HistoryEntry {
        command: command.to_string(),
        args: Vec::new(),
        exit_code: 0,
        stdout: "out".to_string(),
        stderr: String::new(),
        start_time: Utc::now(),
        duration_ms: 3,
    }
}

fn process_manager(dir: &tempfile::TempDir) -> ProcessManager {
    ProcessManager::new(
        dir.path().join("processes"),
        Arc::new(ResourceSampler::default()),
        EventBus::new(),
    )
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_session_exists_after_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;

    let info = m.resolve(DEFAULT_SESSION).expect("default session");
    assert_eq!(info.id, DEFAULT_SESSION);
    assert_eq!(info.name, DEFAULT_SESSION);
}

#[tokio::test]
async fn default_session_cannot_be_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;
    let pm = process_manager(&dir);

    let err = m.delete_session(DEFAULT_SESSION, &pm).await.unwrap_err();
    assert!(err.to_string().contains("default"));
    assert!(m.resolve(DEFAULT_SESSION).is_some());
}

#[tokio::test]
async fn create_resolve_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;
    let pm = process_manager(&dir);

    let info = m
        .create_session("build", Some("/tmp".to_string()), None)
        .unwrap();
    assert_eq!(info.cwd, "/tmp");
    assert!(m.resolve("build").is_some());
    assert!(m.resolve(&info.id).is_some());

    m.delete_session("build", &pm).await.unwrap();
    assert!(m.resolve("build").is_none());
}

#[tokio::test]
async fn session_env_feeds_exec_context() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;

    let mut env = HashMap::new();
    env.insert("RUST_LOG".to_string(), "debug".to_string());
    m.create_session("dev", Some("/srv".to_string()), Some(env))
        .unwrap();
    m.set_env_var("dev", "EXTRA", Some("1".to_string())).unwrap();

    let (cwd, env) = m.exec_context("dev").unwrap();
    assert_eq!(cwd, "/srv");
    assert_eq!(env.get("RUST_LOG").map(String::as_str), Some("debug"));
    assert_eq!(env.get("EXTRA").map(String::as_str), Some("1"));

    m.set_env_var("dev", "EXTRA", None).unwrap();
    let (_, env) = m.exec_context("dev").unwrap();
    assert!(!env.contains_key("EXTRA"));
}

#[tokio::test]
async fn update_cwd_changes_exec_context() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;

    m.create_session("nav", Some("/a".to_string()), None).unwrap();
    m.update_cwd("nav", "/b").unwrap();
    assert_eq!(m.exec_context("nav").unwrap().0, "/b");
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_appends_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;

    for i in 0..5 {
        m.add_to_history(DEFAULT_SESSION, entry(&format!("echo {i}")))
            .unwrap();
    }
    let all = m.history(DEFAULT_SESSION, None);
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].command, "echo 0");

    let last_two = m.history(DEFAULT_SESSION, Some(2));
    assert_eq!(last_two.len(), 2);
    assert_eq!(last_two[0].command, "echo 3");
    assert_eq!(last_two[1].command, "echo 4");
}

#[tokio::test]
async fn history_for_unknown_session_fails() {
    let dir = tempfile::tempdir().unwrap();
    let m = SessionManager::new(dir.path().join("sessions"));
    m.initialize().await;
    assert!(m.add_to_history("ghost", entry("echo")).is_err());
    assert!(m.history("ghost", None).is_empty());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn flushed_sessions_reload_with_history() {
    let dir = tempfile::tempdir().unwrap();
    let sessions_dir = dir.path().join("sessions");

    {
        let m = SessionManager::new(sessions_dir.clone());
        m.initialize().await;
        m.create_session("persisted", Some("/opt".to_string()), None)
            .unwrap();
        m.add_to_history("persisted", entry("make all")).unwrap();
        m.flush_pending_saves().await;
    }

    let reloaded = SessionManager::new(sessions_dir);
    reloaded.initialize().await;
    let info = reloaded.resolve("persisted").expect("reloaded session");
    assert_eq!(info.cwd, "/opt");
    let history = reloaded.history("persisted", None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].command, "make all");
}

#[tokio::test]
async fn session_file_uses_the_documented_shape() {
    let dir = tempfile::tempdir().unwrap();
    let sessions_dir = dir.path().join("sessions");

    let m = SessionManager::new(sessions_dir.clone());
    m.initialize().await;
    let info = m
        .create_session("shape", Some("/x".to_string()), None)
        .unwrap();
    m.add_to_history("shape", entry("ls")).unwrap();
    m.flush_pending_saves().await;

    let content = tokio::fs::read_to_string(sessions_dir.join(format!("{}.json", info.id)))
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(parsed["id"], info.id.as_str());
    assert_eq!(parsed["name"], "shape");
    assert_eq!(parsed["cwd"], "/x");
    assert!(parsed["created"].is_string());
    assert!(parsed["lastUsed"].is_string());
    assert_eq!(parsed["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_a_session_removes_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let sessions_dir = dir.path().join("sessions");
    let m = SessionManager::new(sessions_dir.clone());
    m.initialize().await;
    let pm = process_manager(&dir);

    let info = m.create_session("gone", None, None).unwrap();
    m.flush_pending_saves().await;
    let path = sessions_dir.join(format!("{}.json", info.id));
    assert!(path.exists());

    m.delete_session("gone", &pm).await.unwrap();
    assert!(!path.exists());
}
