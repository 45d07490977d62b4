use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSessionRequest {
    /// Unique session name
    pub name: String,
    /// Initial working directory (defaults to the home directory)
    pub cwd: Option<String>,
    /// Environment variables applied to every command in the session
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteSessionRequest {
    /// Session name or id. The default session cannot be deleted.
    pub session: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionHistoryRequest {
    /// Session name or id
    pub session: String,
    /// Most-recent entries to return (defaults to all retained)
    pub limit: Option<usize>,
}
