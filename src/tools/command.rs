use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandRequest {
    /// The shell command to execute (passed opaquely to `sh -c`)
    pub command: String,
    /// Session name or id (defaults to the "default" session)
    pub session: Option<String>,
    /// Working directory override (defaults to the session's cwd)
    pub cwd: Option<String>,
    /// Per-attempt timeout in milliseconds (default 30000, max 600000)
    pub timeout_ms: Option<u64>,
    /// Line budget for returned output; longer output keeps the head and
    /// tail with an omission marker (default 300)
    pub max_output_lines: Option<usize>,
}

/// Ceiling on per-attempt timeouts from untrusted input.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

impl RunCommandRequest {
    pub fn session_or_default(&self) -> &str {
        self.session
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(crate::session::DEFAULT_SESSION)
    }

    pub fn clamped_timeout_ms(&self) -> Option<u64> {
        self.timeout_ms.map(|t| t.min(MAX_TIMEOUT_MS))
    }
}
