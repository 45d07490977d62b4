use schemars::JsonSchema;
use serde::Deserialize;

use crate::process::manager::ProcessSignal;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunBackgroundRequest {
    /// Executable to spawn (not passed through a shell)
    pub command: String,
    /// Arguments, preserving the caller's splitting
    pub args: Option<Vec<String>>,
    /// Session name or id (defaults to the "default" session)
    pub session: Option<String>,
    /// Working directory override (defaults to the session's cwd)
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessOutputRequest {
    /// Background process id
    pub process_id: String,
    /// Return only lines with a line number greater than this
    pub after_line: Option<u64>,
    /// Block up to this many milliseconds for new lines past `after_line`;
    /// returns empty (not an error) when nothing arrives in time
    pub wait_ms: Option<u64>,
    /// Maximum lines to return
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListProcessesRequest {
    /// Restrict to one session (name or id)
    pub session: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct KillProcessRequest {
    /// Background process id
    pub process_id: String,
    /// Signal to deliver (defaults to SIGTERM)
    pub signal: Option<ProcessSignal>,
}
