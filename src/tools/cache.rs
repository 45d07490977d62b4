use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CacheClearCommandRequest {
    /// Command whose cached results should be dropped
    pub command: String,
    /// Restrict clearing to this working directory; omitted clears the
    /// command in every directory
    pub cwd: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CacheClearPatternRequest {
    /// Regex matched against normalized cached commands
    pub pattern: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CacheMarkNeverRequest {
    /// Command (or regex when is_pattern) that must never be cached
    pub command: String,
    /// Treat `command` as a regex
    #[serde(default)]
    pub is_pattern: bool,
    /// Why this command must not be cached (stored with the rule)
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CacheExplainRequest {
    /// Command to classify
    pub command: String,
}
