use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("session {session} already has {count} background processes (max {max})")]
    SessionProcessLimit {
        session: String,
        count: usize,
        max: usize,
    },

    #[error("background process limit reached: {count} (max {max})")]
    TotalProcessLimit { count: usize, max: usize },

    #[error("cannot delete the default session")]
    DefaultSessionUndeletable,

    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ShellError {
    /// Produce a sanitized error message safe for returning to MCP clients.
    /// Does not leak filesystem layout or raw stderr from privileged paths.
    pub fn user_message(&self) -> String {
        match self {
            Self::SessionNotFound(name) => format!("session not found: {name}"),
            Self::ProcessNotFound(id) => format!("process not found: {id}"),
            Self::SessionProcessLimit { session, max, .. } => {
                format!("session {session} is at its background process limit ({max})")
            }
            Self::TotalProcessLimit { max, .. } => {
                format!("background process limit reached ({max})")
            }
            Self::DefaultSessionUndeletable => "the default session cannot be deleted".to_string(),
            Self::InvalidPattern(_) => "invalid regex pattern".to_string(),
            Self::Timeout(ms) => format!("command timed out after {ms}ms"),
            Self::Spawn(_) => "failed to spawn process".to_string(),
            Self::Persistence(_) => "persistence error".to_string(),
            Self::Serialization(_) => "serialization error".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
